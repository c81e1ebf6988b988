//! Background render worker.

mod common;

use std::time::Duration;

use rtcore::device::host::FaultPlan;
use rtcore::render::{ProgressiveRenderer, RenderEvent, RenderOutcome, RenderState, RenderWorker, RendererConfig};

fn wait_finished(worker: &RenderWorker, events: &mut Vec<RenderEvent>) -> rtcore::Result<RenderOutcome> {
    loop {
        match worker.recv_timeout(Duration::from_secs(30)) {
            Some(RenderEvent::Finished(result)) => return result,
            Some(event) => events.push(event),
            None => panic!("worker sent no Finished event"),
        }
    }
}

#[test]
fn test_worker_renders_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let (_host, device) = common::host_device();
    let renderer = ProgressiveRenderer::new(device.clone(), RendererConfig::default()).unwrap();
    let mut worker = RenderWorker::spawn(renderer);
    let scene = common::quad_scene(&device);
    let params = common::small_params(dir.path(), 8, 4);

    assert!(worker.request_render(scene.clone(), params.clone()));

    let mut events = Vec::new();
    let outcome = wait_finished(&worker, &mut events).unwrap();
    assert!(matches!(outcome, RenderOutcome::Completed(ref r) if r.batches == 2));
    assert!(!worker.is_busy());
    assert_eq!(worker.status().state(), RenderState::Done);

    let batches: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            RenderEvent::Batch { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![0.5, 1.0]);
    assert!(matches!(events.first(), Some(RenderEvent::State(RenderState::Building))));

    // Accepts a new request once the previous one finished
    assert!(worker.request_render(scene, params));
    wait_finished(&worker, &mut Vec::new()).unwrap();
    worker.stop();
}

#[test]
fn test_worker_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (_host, device) = common::host_device();
    let renderer = ProgressiveRenderer::new(device.clone(), RendererConfig::default()).unwrap();
    let worker = RenderWorker::spawn(renderer);
    let scene = common::quad_scene(&device);
    let mut params = common::small_params(dir.path(), 8, 4);
    params.samples = 7;

    assert!(worker.request_render(scene, params));
    let result = wait_finished(&worker, &mut Vec::new());
    assert!(matches!(result, Err(rtcore::Error::InvalidRenderParams(_))));
}

#[test]
fn test_worker_refuses_while_pending() {
    let dir = tempfile::tempdir().unwrap();
    let (_host, device) = common::host_device_with(FaultPlan {
        stall_traces_from: Some(0),
        ..Default::default()
    });
    let config = RendererConfig {
        batch_timeout_ms: 200,
        ..Default::default()
    };
    let renderer = ProgressiveRenderer::new(device.clone(), config).unwrap();
    let worker = RenderWorker::spawn(renderer);
    let scene = common::quad_scene(&device);
    let params = common::small_params(dir.path(), 8, 4);

    assert!(worker.request_render(scene.clone(), params.clone()));
    assert!(worker.is_busy());
    assert!(!worker.request_render(scene, params));

    let result = wait_finished(&worker, &mut Vec::new());
    assert!(matches!(result, Err(rtcore::Error::BatchTimeout { .. })));
    assert!(common::files_in(dir.path()).is_empty());
}
