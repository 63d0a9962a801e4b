//! The background thread rewriting the point classification of the feature map.

use crate::feature_map::RmvFeatureMap;
use cv_core::nalgebra::Point2;
use cv_core::WorldToCamera;
use cv_pinhole::PinholeCamera;
use log::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The data of a tracked frame the classification is derived from.
#[derive(Debug, Clone)]
pub struct Job {
    pub pose_if: WorldToCamera,
    pub camera: PinholeCamera,
    pub image_points: Vec<Point2<f64>>,
}

/// Rewrites the classification of a feature map from a job.
pub type Processor = dyn Fn(&mut RmvFeatureMap, &Job) + Send + Sync;

#[derive(Debug)]
enum PendingJob {
    Empty,
    Ready(Job),
    InFlight,
}

/// The state shared by the tracker and its background thread.
pub struct Shared {
    pub feature_map: Option<RmvFeatureMap>,
    job: PendingJob,
    stop: bool,
}

impl Shared {
    fn is_idle(&self) -> bool {
        matches!(self.job, PendingJob::Empty)
    }
}

type State = (Mutex<Shared>, Condvar);

/// Runs at most one job at a time on a dedicated thread.
///
/// The shared state stays locked while a job runs, so the map is never observed in the middle of an update.
pub struct Background {
    state: Arc<State>,
    processor: Arc<Processor>,
    thread: Option<JoinHandle<()>>,
}

fn run(state: &State, processor: &Processor) {
    let (shared, signal) = state;
    let mut shared = shared.lock();
    loop {
        while !shared.stop && !matches!(shared.job, PendingJob::Ready(_)) {
            signal.wait(&mut shared);
        }
        if shared.stop {
            break;
        }
        process(&mut shared, processor);
    }
}

fn process(shared: &mut Shared, processor: &Processor) {
    if let PendingJob::Ready(job) = std::mem::replace(&mut shared.job, PendingJob::InFlight) {
        if let Some(feature_map) = shared.feature_map.as_mut() {
            processor(feature_map, &job);
        }
    }
    shared.job = PendingJob::Empty;
}

impl Background {
    /// Starts the background thread.
    ///
    /// If no thread can be spawned, posted jobs are processed on the posting thread instead.
    pub fn new(processor: Arc<Processor>) -> Self {
        let state: Arc<State> = Arc::new((
            Mutex::new(Shared {
                feature_map: None,
                job: PendingJob::Empty,
                stop: false,
            }),
            Condvar::new(),
        ));
        let thread = {
            let state = state.clone();
            let processor = processor.clone();
            std::thread::Builder::new()
                .name("rmv-background".into())
                .spawn(move || run(&state, &*processor))
        };
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(e) => {
                warn!("unable to spawn the background thread, classifying synchronously: {}", e);
                None
            }
        };
        Self {
            state,
            processor,
            thread,
        }
    }

    /// The shared state, for locking it without borrowing the background.
    pub fn state(&self) -> Arc<(Mutex<Shared>, Condvar)> {
        self.state.clone()
    }

    pub fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.0.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.state.0.lock().is_idle()
    }

    /// Blocks until no job is pending or running.
    pub fn wait_until_idle(&self) {
        while !self.is_idle() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Hands a job to the background thread, waiting for a previous job first.
    pub fn post(&self, job: Job) {
        self.wait_until_idle();
        let mut shared = self.state.0.lock();
        shared.job = PendingJob::Ready(job);
        if self.thread.is_some() {
            self.state.1.notify_one();
        } else {
            process(&mut shared, &*self.processor);
        }
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.state.0.lock().stop = true;
        self.state.1.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("the background thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorType;
    use cv_core::nalgebra::Point3;
    use cv_core::CameraPose;
    use std::time::Instant;

    fn map() -> RmvFeatureMap {
        let points = (0..10).map(|index| Point3::new(index as f64 * 0.01, 0.0, 0.0)).collect();
        RmvFeatureMap::new(points, PinholeCamera::from_fov_x(640, 480, 1.0), DetectorType::Fast).unwrap()
    }

    fn job() -> Job {
        Job {
            pose_if: CameraPose::identity().to_inverted_flipped(),
            camera: PinholeCamera::from_fov_x(640, 480, 1.0),
            image_points: vec![Point2::new(1.0, 2.0); 3],
        }
    }

    #[test]
    fn waiting_blocks_until_slow_job_is_written() {
        let processor: Arc<Processor> = Arc::new(|feature_map: &mut RmvFeatureMap, job: &Job| {
            // Writes the indices in two steps with a delay in between.
            feature_map.set_most_recent_object_point_indices(vec![0], vec![], vec![0]);
            std::thread::sleep(Duration::from_millis(200));
            let strong: Vec<usize> = (0..job.image_points.len()).collect();
            feature_map.set_most_recent_object_point_indices(strong.clone(), vec![5, 6], strong);
        });
        let background = Background::new(processor);
        background.lock().feature_map = Some(map());

        let start = Instant::now();
        background.post(job());
        background.wait_until_idle();
        assert!(start.elapsed() >= Duration::from_millis(150));

        let shared = background.lock();
        let feature_map = shared.feature_map.as_ref().unwrap();
        assert_eq!(feature_map.recent_strong_object_point_indices(), &[0, 1, 2]);
        assert_eq!(feature_map.recent_semi_strong_object_point_indices(), &[5, 6]);
    }

    #[test]
    fn posting_waits_for_previous_job() {
        let processor: Arc<Processor> = Arc::new(|feature_map: &mut RmvFeatureMap, job: &Job| {
            std::thread::sleep(Duration::from_millis(50));
            let used: Vec<usize> = (0..job.image_points.len()).collect();
            feature_map.set_most_recent_object_point_indices(vec![], vec![], used);
        });
        let background = Background::new(processor);
        background.lock().feature_map = Some(map());
        background.post(job());
        let mut second = job();
        second.image_points.push(Point2::new(0.0, 0.0));
        background.post(second);
        background.wait_until_idle();
        let shared = background.lock();
        assert_eq!(
            shared.feature_map.as_ref().unwrap().recent_used_object_point_indices(),
            &[0, 1, 2, 3]
        );
    }

    #[test]
    fn drop_joins_idle_thread() {
        let background = Background::new(Arc::new(|_: &mut RmvFeatureMap, _: &Job| {}));
        assert!(background.is_idle());
        drop(background);
    }
}
