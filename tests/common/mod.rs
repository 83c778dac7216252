#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::{Rgba, RgbaImage};
use imagescript::{
    ColorScale, GeoBounds, GeoPoint, IslResult, MovieEncoder, RenderableView, ScriptEvaluator,
    ViewRegistry,
};

/// Route interpreter logs through the test harness. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A fixed-size view with optional georeferencing and color scales.
pub struct MockView {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub background: Rgba<u8>,
    pub bounds: Option<GeoBounds>,
    pub scales: Vec<ColorScale>,
}

impl MockView {
    pub fn new(name: &str, width: u32, height: u32, background: Rgba<u8>) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            background,
            bounds: None,
            scales: Vec::new(),
        }
    }

    pub fn with_bounds(mut self, bounds: GeoBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_scale(mut self, scale: ColorScale) -> Self {
        self.scales.push(scale);
        self
    }
}

impl RenderableView for MockView {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn class_name(&self) -> &str {
        "MockView"
    }

    fn capture_frame(&self) -> IslResult<RgbaImage> {
        Ok(RgbaImage::from_pixel(self.width, self.height, self.background))
    }

    fn screen_to_geo(&self, x: f64, y: f64) -> Option<GeoPoint> {
        let b = self.bounds?;
        Some(GeoPoint {
            lat: b.north - y / f64::from(self.height) * (b.north - b.south),
            lon: b.west + x / f64::from(self.width) * (b.east - b.west),
        })
    }

    fn geo_to_screen(&self, point: GeoPoint) -> Option<(f64, f64)> {
        let b = self.bounds?;
        Some((
            (point.lon - b.west) / (b.east - b.west) * f64::from(self.width),
            (b.north - point.lat) / (b.north - b.south) * f64::from(self.height),
        ))
    }

    fn animation_timestamp(&self) -> Option<i64> {
        None
    }

    fn background_color(&self) -> Rgba<u8> {
        self.background
    }

    fn color_scales(&self) -> Vec<ColorScale> {
        self.scales.clone()
    }
}

pub struct MockRegistry {
    views: Vec<Arc<dyn RenderableView>>,
}

impl MockRegistry {
    pub fn single(view: MockView) -> Arc<Self> {
        Arc::new(Self {
            views: vec![Arc::new(view)],
        })
    }

    pub fn of(views: Vec<MockView>) -> Arc<Self> {
        Arc::new(Self {
            views: views
                .into_iter()
                .map(|v| Arc::new(v) as Arc<dyn RenderableView>)
                .collect(),
        })
    }
}

impl ViewRegistry for MockRegistry {
    fn views(&self) -> Vec<Arc<dyn RenderableView>> {
        self.views.clone()
    }
}

/// Compares `lhs == rhs` expressions; anything else echoes back.
pub struct EqualityEvaluator;

impl ScriptEvaluator for EqualityEvaluator {
    fn eval(&self, expr: &str) -> IslResult<String> {
        match expr.split_once("==") {
            Some((lhs, rhs)) => Ok(if lhs.trim() == rhs.trim() {
                "1".to_string()
            } else {
                "0".to_string()
            }),
            None => Ok(expr.to_string()),
        }
    }
}

/// Records encode calls and writes a marker file as the "movie".
#[derive(Default)]
pub struct MockEncoder {
    pub calls: Mutex<Vec<(Vec<PathBuf>, PathBuf, f64)>>,
}

impl MovieEncoder for MockEncoder {
    fn encode(
        &self,
        frames: &[PathBuf],
        output: &Path,
        framerate: f64,
        _end_frame_pause: Option<f64>,
    ) -> IslResult<()> {
        std::fs::write(output, b"movie")?;
        self.calls
            .lock()
            .unwrap()
            .push((frames.to_vec(), output.to_path_buf(), framerate));
        Ok(())
    }
}
