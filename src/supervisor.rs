use anyhow::Result;

use crate::runtime::{self, TaskHandle};
use crate::worker::{CameraWorker, PipelineContext, WorkerSettings};
use crate::CameraDescriptor;

/// Outcome of `StreamSupervisor::start_all`.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    /// Camera id and the reason its worker did not start.
    pub failed: Vec<(String, String)>,
}

struct RunningWorker {
    camera: CameraDescriptor,
    handle: TaskHandle,
}

impl RunningWorker {
    /// The thread ended although nobody asked it to.
    fn died(&self) -> bool {
        self.handle.is_finished() && !self.handle.stop_requested()
    }
}

/// Owns one running worker per camera.
pub struct StreamSupervisor {
    ctx: PipelineContext,
    settings: WorkerSettings,
    workers: Vec<RunningWorker>,
}

impl StreamSupervisor {
    pub fn new(ctx: PipelineContext, settings: WorkerSettings) -> Self {
        Self {
            ctx,
            settings,
            workers: Vec::new(),
        }
    }

    /// Start a worker for every camera. A camera that cannot be started is
    /// reported and skipped.
    pub fn start_all(&mut self, cameras: &[CameraDescriptor]) -> StartReport {
        let mut report = StartReport::default();
        for camera in cameras {
            match self.start_one(camera) {
                Ok(()) => {
                    log::info!("worker started for camera {} ({})", camera.id, camera.name);
                    report.started.push(camera.id.clone());
                }
                Err(err) => {
                    log::error!("worker for camera {} failed to start: {:#}", camera.id, err);
                    report.failed.push((camera.id.clone(), format!("{:#}", err)));
                }
            }
        }
        report
    }

    fn start_one(&mut self, camera: &CameraDescriptor) -> Result<()> {
        if self.workers.iter().any(|w| w.camera.id == camera.id) {
            anyhow::bail!("camera {} already has a worker", camera.id);
        }
        crate::validate_camera_id(&camera.id)?;
        let handle = self.spawn(camera)?;
        self.workers.push(RunningWorker {
            camera: camera.clone(),
            handle,
        });
        Ok(())
    }

    fn spawn(&self, camera: &CameraDescriptor) -> Result<TaskHandle> {
        let worker = CameraWorker::new(camera.clone(), self.ctx.clone(), self.settings.clone());
        runtime::start(worker)
    }

    /// Cameras whose worker thread has ended without a stop request.
    pub fn finished_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.died())
            .map(|w| w.camera.id.clone())
            .collect()
    }

    /// Reap every worker that died and start a fresh one for its camera.
    ///
    /// Returns the cameras that are running again. A camera whose replacement
    /// cannot be spawned is dropped from the supervisor.
    pub fn restart_finished(&mut self) -> Vec<String> {
        let mut restarted = Vec::new();
        let mut kept = Vec::with_capacity(self.workers.len());
        for worker in std::mem::take(&mut self.workers) {
            if !worker.died() {
                kept.push(worker);
                continue;
            }
            let RunningWorker { camera, handle } = worker;
            match handle.join() {
                Ok(()) => log::warn!("worker for camera {} exited unexpectedly", camera.id),
                Err(err) => log::error!("worker for camera {} died: {:#}", camera.id, err),
            }
            match self.spawn(&camera) {
                Ok(handle) => {
                    log::info!("worker restarted for camera {} ({})", camera.id, camera.name);
                    restarted.push(camera.id.clone());
                    kept.push(RunningWorker { camera, handle });
                }
                Err(err) => {
                    log::error!("worker for camera {} could not be restarted: {:#}", camera.id, err);
                }
            }
        }
        self.workers = kept;
        restarted
    }

    /// Signal every worker and wait for each to stop. Safe to call repeatedly.
    pub fn stop_all(&mut self) {
        for worker in &self.workers {
            if worker.died() {
                log::warn!("worker for camera {} had already exited", worker.camera.id);
            }
            worker.handle.stop();
        }
        for RunningWorker { camera, handle } in self.workers.drain(..) {
            if let Err(err) = handle.join() {
                log::error!("worker for camera {} did not stop cleanly: {:#}", camera.id, err);
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.camera.id.clone()).collect()
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
