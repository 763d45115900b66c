use crate::*;
use std::thread;

use cinerender_core::colour::ColourConversion;
use cinerender_core::descriptor::{PositionImage, RgbaImage};
use cinerender_core::image::{PixelFormat, RawImageProxy};
use cinerender_core::{Crop, Eyes, Part, Position};
use cinerender_net::{JobState, PassthroughEncoder, RenderClient, WorkerJob};

fn subtitle(size: Size, at: Position) -> PositionImage {
    let pixels: Vec<u8> = (0..size.area() * 4).map(|i| (i % 256) as u8).collect();
    let image = RgbaImage::new(size, Bytes::from(pixels)).unwrap();
    PositionImage::new(image, at)
}

#[test]
fn test_passthrough_round_trip() {
    let worker = spawn_worker(Arc::new(PassthroughEncoder)).unwrap();
    let job = flat_job(2 << 20);

    let mut run = WorkerJob::new(worker.addr.clone(), &test_config());
    let result = run.run(&job).unwrap();

    assert_eq!(run.state(), JobState::Done);
    assert_eq!(result.len(), 2 << 20);
    assert_eq!(&result.data[..], job.input.binary());
}

/// The worker sees the subtitle block exactly as it was sent.
#[test]
fn test_subtitle_survives_the_wire() {
    let encoder = Arc::new(RecordingEncoder::default());
    let worker = spawn_worker(encoder.clone()).unwrap();

    let mut job = flat_job(2 << 20);
    job.subtitle = Some(subtitle(Size::new(64, 64), Position::new(100, 900)));

    let mut run = WorkerJob::new(worker.addr.clone(), &test_config());
    run.run(&job).unwrap();
    assert_eq!(run.state(), JobState::Done);

    let received = encoder.last_job().unwrap();
    let sub = received.subtitle.as_ref().unwrap();
    assert_eq!(sub.image.size(), Size::new(64, 64));
    assert_eq!(sub.position, Position::new(100, 900));
    assert_eq!(sub.image.data().len(), 64 * 64 * 4);
    assert!(received.same(&job));
    assert!(received == job);
}

/// Every header field, not just the common ones.
#[test]
fn test_full_descriptor_survives_the_wire() {
    let encoder = Arc::new(RecordingEncoder::default());
    let worker = spawn_worker(encoder.clone()).unwrap();

    let pixels = Bytes::from(vec![0x7f; 320 * 180 * 6]);
    let input = RawImageProxy::new(Size::new(320, 180), PixelFormat::Rgb48Le, pixels).unwrap();
    let mut job = JobDescriptor::new(Arc::new(input), Size::new(1998, 1080));
    job.time = 96_000 * 3600 + 17;
    job.crop = Crop::new(4, 4, 2, 0);
    job.fade = Some(0.25);
    job.inter_size = Size::new(1920, 1080);
    job.eyes = Eyes::Right;
    job.part = Part::LeftHalf;
    job.colour_conversion = Some(ColourConversion::rec709());
    job.subtitle = Some(subtitle(Size::new(10, 3), Position::new(-5, 1000)));

    WorkerJob::new(worker.addr.clone(), &test_config()).run(&job).unwrap();

    let received = encoder.last_job().unwrap();
    assert_eq!(received.time, job.time);
    assert_eq!(received.crop, job.crop);
    assert_eq!(received.fade, Some(0.25));
    assert_eq!(received.inter_size, job.inter_size);
    assert_eq!(received.eyes, Eyes::Right);
    assert_eq!(received.part, Part::LeftHalf);
    assert_eq!(received.colour_conversion, job.colour_conversion);
    assert_eq!(received.inter_position(), Position::new(39, 0));
    assert!(received == job);
}

#[test]
fn test_render_client_memoizes_identical_frames() {
    let encoder = Arc::new(RecordingEncoder::default());
    let worker = spawn_worker(encoder.clone()).unwrap();
    let mut client = RenderClient::new(worker.addr.clone(), &test_config());

    let mut job = flat_job(8192);
    job.time = 1;
    let first = client.render(&job).unwrap();

    // Same picture, later time: served from the memo.
    job.time = 2;
    let second = client.render(&job).unwrap();
    assert_eq!(first, second);
    assert_eq!(encoder.calls(), 1);
    assert_eq!(client.memo_hits(), 1);

    // Different picture: goes back to the worker.
    job.crop = Crop::new(1, 0, 0, 0);
    let third = client.render(&job).unwrap();
    assert_eq!(&third.data[..], b"frame@2");
    assert_eq!(encoder.calls(), 2);

    client.clear_cache();
    client.render(&job).unwrap();
    assert_eq!(encoder.calls(), 3);
    assert_eq!(client.last_job_state(), JobState::Done);
}

/// Parallelism comes from independent connections, one thread each.
#[test]
fn test_parallel_jobs_on_separate_connections() {
    let encoder = Arc::new(RecordingEncoder::default());
    let worker = spawn_worker(encoder.clone()).unwrap();

    let handles: Vec<_> = (0..8i64)
        .map(|t| {
            let addr = worker.addr.clone();
            thread::spawn(move || {
                let mut job = flat_job(256 * 1024);
                job.time = t;
                WorkerJob::new(addr, &test_config()).run(&job)
            })
        })
        .collect();

    let mut frames: Vec<String> = handles
        .into_iter()
        .map(|h| {
            let result = h.join().unwrap().unwrap();
            String::from_utf8(result.data.to_vec()).unwrap()
        })
        .collect();
    frames.sort();

    let expected: Vec<String> = (0..8).map(|t| format!("frame@{t}")).collect();
    assert_eq!(frames, expected);
    assert_eq!(encoder.calls(), 8);
}
