use cv_core::nalgebra::{Point2, Vector2};
use cv_pinhole::{CameraIntrinsics, PinholeCamera};
use cv_rmv::{DetectorType, RmvFeatureDetector, RmvFeatureMap, RmvTracker, TrackerSettings, Worker};
use log::*;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::Serialize;
use std::path::PathBuf;
use structopt::StructOpt;

fn parse_detector(name: &str) -> Result<DetectorType, String> {
    match name.to_ascii_lowercase().as_str() {
        "fast" => Ok(DetectorType::Fast),
        "harris" => Ok(DetectorType::Harris),
        other => Err(format!("unknown detector {other:?}, expected fast or harris")),
    }
}

#[derive(StructOpt, Clone)]
#[structopt(name = "rmv-sandbox", about = "A tool for tracking a camera against a planar reference image")]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_rmv::TrackerSettings`.
    #[structopt(short, long, default_value = "rmv-settings.json")]
    settings: PathBuf,
    /// The image of the planar pattern that is tracked
    #[structopt(short, long)]
    reference: PathBuf,
    /// The physical width of the reference image
    #[structopt(long, default_value = "0.2")]
    reference_width: f64,
    /// The physical height of the reference image, zero derives it from the aspect ratio
    #[structopt(long, default_value = "0.0")]
    reference_height: f64,
    /// The maximal number of features taken from the reference image
    #[structopt(long, default_value = "400")]
    max_reference_features: usize,
    /// The feature detector, either fast or harris
    #[structopt(long, default_value = "fast", parse(try_from_str = parse_detector))]
    detector: DetectorType,
    /// The horizontal field of view in degrees, used when no focal length is given
    #[structopt(long, default_value = "60.0")]
    fov_x: f64,
    /// The x focal length
    #[structopt(long)]
    x_focal: Option<f64>,
    /// The y focal length, defaults to the x focal length
    #[structopt(long)]
    y_focal: Option<f64>,
    /// The x optical center coordinate, defaults to the image center
    #[structopt(long)]
    x_center: Option<f64>,
    /// The y optical center coordinate, defaults to the image center
    #[structopt(long)]
    y_center: Option<f64>,
    /// The frames have already been undistorted
    #[structopt(long)]
    undistorted: bool,
    /// Draw random seed poses that see the reference instead of the regular hemisphere
    #[structopt(long)]
    random_seeds: bool,
    /// The number of worker threads, zero uses all cores
    #[structopt(short, long, default_value = "0")]
    threads: usize,
    /// Output JSON file to deposit the tracked poses
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// List of frame files
    #[structopt(parse(from_os_str))]
    images: Vec<PathBuf>,
}

impl Opt {
    fn camera(&self, width: u32, height: u32) -> PinholeCamera {
        match self.x_focal {
            Some(x_focal) => {
                let intrinsics = CameraIntrinsics::identity()
                    .focals(Vector2::new(x_focal, self.y_focal.unwrap_or(x_focal)))
                    .principal_point(Point2::new(
                        self.x_center.unwrap_or(width as f64 * 0.5),
                        self.y_center.unwrap_or(height as f64 * 0.5),
                    ));
                PinholeCamera::new(width, height, intrinsics)
            }
            None => PinholeCamera::from_fov_x(width, height, self.fov_x.to_radians()),
        }
    }
}

/// The pose of one frame as written to the output file.
#[derive(Serialize)]
struct TrackedFrame {
    frame: PathBuf,
    strategy: Option<String>,
    /// The camera position in the units of the reference dimension.
    position: Option<[f64; 3]>,
    /// The camera orientation as `[w, x, y, z]`.
    orientation: Option<[f64; 4]>,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = std::fs::File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let mut settings: TrackerSettings = settings.unwrap_or_default();
    settings.random_seed_poses |= opt.random_seeds;

    let reference = match image::open(&opt.reference) {
        Ok(reference) => reference,
        Err(e) => {
            error!("unable to load the reference image {}: {}", opt.reference.display(), e);
            return;
        }
    };
    let Some(first) = opt.images.first() else {
        info!("no frames given, nothing to track");
        return;
    };
    let (width, height) = match image::image_dimensions(first) {
        Ok(dimensions) => dimensions,
        Err(e) => {
            error!("unable to read the size of {}: {}", first.display(), e);
            return;
        }
    };
    let camera = opt.camera(width, height);

    let feature_map = match RmvFeatureMap::from_image(
        &reference,
        Vector2::new(opt.reference_width, opt.reference_height),
        camera,
        opt.detector,
        opt.max_reference_features,
    ) {
        Ok(feature_map) => feature_map,
        Err(e) => {
            error!("unable to create the feature map: {}", e);
            return;
        }
    };
    info!("created a feature map with {} points", feature_map.object_points().len());

    let worker = match Worker::new(opt.threads) {
        Ok(worker) => Some(worker),
        Err(e) => {
            warn!("unable to create the worker, tracking on one thread: {}", e);
            None
        }
    };
    let mut tracker = RmvTracker::with_detector(Box::new(RmvFeatureDetector::new(opt.detector)), settings);
    tracker.set_feature_map_with_worker(feature_map, &mut Pcg64::from_seed([5; 32]), true, worker.as_ref());
    info!("scoring {} seed poses per cold start", tracker.seed_bank().len());

    let mut tracked_frames = Vec::with_capacity(opt.images.len());
    for path in &opt.images {
        let frame = match image::open(path) {
            Ok(frame) => frame,
            Err(e) => {
                error!("unable to load frame {}: {}", path.display(), e);
                continue;
            }
        };
        let tracked = match tracker.determine_poses(&frame, &camera, opt.undistorted, None, worker.as_ref()) {
            Ok(sample) => {
                let position = sample.pose.position();
                let orientation = sample.pose.orientation();
                info!("{}: camera at {:?}", path.display(), position);
                TrackedFrame {
                    frame: path.clone(),
                    strategy: tracker.last_strategy().map(|strategy| format!("{strategy:?}")),
                    position: Some([position.x, position.y, position.z]),
                    orientation: Some([orientation.w, orientation.i, orientation.j, orientation.k]),
                }
            }
            Err(e) => {
                info!("{}: {}", path.display(), e);
                TrackedFrame {
                    frame: path.clone(),
                    strategy: None,
                    position: None,
                    orientation: None,
                }
            }
        };
        tracked_frames.push(tracked);
    }

    let found = tracked_frames.iter().filter(|frame| frame.position.is_some()).count();
    info!("tracked {} of {} frames", found, tracked_frames.len());

    if let Some(path) = opt.output {
        info!("exporting the tracked poses");
        match std::fs::File::create(&path) {
            Ok(file) => {
                if let Err(e) = serde_json::to_writer_pretty(file, &tracked_frames) {
                    error!("unable to write the tracked poses: {}", e);
                }
            }
            Err(e) => error!("unable to create {}: {}", path.display(), e),
        }
    }
}
