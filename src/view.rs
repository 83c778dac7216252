use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use image::{Rgba, RgbaImage};

use crate::error::IslResult;

/// A geographic location, degrees north / degrees east.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// A lat/lon rectangle. `north > south`, `west < east`.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct GeoBounds {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

/// A color scale published by a display: the ramp, its data range and
/// an optional unit label. Scales with identical `(name, range)` are
/// collapsed when rendering color bars.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ColorScale {
    pub name: String,
    pub colors: Vec<[u8; 4]>,
    pub range: (f64, f64),
    pub unit: Option<String>,
}

/// A host view the interpreter can capture frames from.
///
/// Implementations are supplied by the embedding application; the
/// interpreter only drives them. All methods must be callable from the
/// interpreter thread.
pub trait RenderableView: Send + Sync {
    /// The view's display name, used by `view="name:..."` matching.
    fn name(&self) -> String;

    /// The view's type name, used by `view="class:..."` matching.
    fn class_name(&self) -> &str;

    /// Block until pending rendering has settled, then rasterize the
    /// current contents.
    fn capture_frame(&self) -> IslResult<RgbaImage>;

    /// Pixel to geographic coordinates, when the view is georeferenced.
    fn screen_to_geo(&self, x: f64, y: f64) -> Option<GeoPoint>;

    /// Geographic to pixel coordinates, when the view is georeferenced.
    fn geo_to_screen(&self, point: GeoPoint) -> Option<(f64, f64)>;

    /// The current animation step's timestamp, seconds since the epoch.
    fn animation_timestamp(&self) -> Option<i64>;

    fn background_color(&self) -> Rgba<u8>;

    /// Color scales of the displays shown in this view.
    fn color_scales(&self) -> Vec<ColorScale>;

    /// Block until pending rendering and data loads have settled.
    /// Views with nothing in flight return immediately.
    fn wait_until_idle(&self) {}
}

/// Enumerates the host application's live views.
pub trait ViewRegistry: Send + Sync {
    fn views(&self) -> Vec<Arc<dyn RenderableView>>;
}

/// A single display (chart, legend, layer) addressable by id.
pub trait DisplayControl: Send + Sync {
    fn id(&self) -> String;
    fn capture_frame(&self) -> IslResult<RgbaImage>;

    /// Geographic extent of the display's data, when it has one.
    fn geo_bounds(&self) -> Option<GeoBounds> {
        None
    }

    fn color_scales(&self) -> Vec<ColorScale> {
        Vec::new()
    }
}

pub trait DisplayRegistry: Send + Sync {
    fn find_display(&self, id: &str) -> Option<Arc<dyn DisplayControl>>;
}

/// Host-side expression evaluator backing `${jython:...}` and the
/// `<if expr=...>` / `<eval>` tags. Conditions are true when the result
/// is the string `"1"`.
pub trait ScriptEvaluator: Send + Sync {
    fn eval(&self, expr: &str) -> IslResult<String>;
}

/// Encodes a list of frame files into a movie container.
pub trait MovieEncoder: Send + Sync {
    fn encode(
        &self,
        frames: &[PathBuf],
        output: &Path,
        framerate: f64,
        end_frame_pause: Option<f64>,
    ) -> IslResult<()>;
}

/// Captures a view's whole animation sequence, asynchronously. `start`
/// kicks off the grab and must arrange for `signal.signal_done()` once
/// every frame has been written; `frames()` is only meaningful after
/// the signal fires.
pub trait SequenceGrabber: Send + Sync {
    fn start(&self, view: Arc<dyn RenderableView>, signal: Arc<CaptureSignal>) -> IslResult<()>;

    /// Frame files in animation order, paired with their timestamps.
    fn frames(&self) -> Vec<(PathBuf, Option<i64>)>;
}

/// Interactive prompts (`ask`, `asktocontinue`). Headless hosts answer
/// with defaults.
pub trait Prompter: Send + Sync {
    /// Yes/no confirmation; `false` aborts the script.
    fn confirm(&self, message: &str) -> bool;

    /// Free-form input; `None` means the user cancelled.
    fn ask(&self, message: &str, default: Option<&str>) -> Option<String>;
}

/// Host data-source management for `<datasource>` and `<setfiles>`.
pub trait DataSourceRegistry: Send + Sync {
    /// Load a data source, returning its id for later reference.
    fn load(&self, source: &str, kind: Option<&str>) -> IslResult<String>;

    fn set_files(&self, id: &str, files: &[String]) -> IslResult<()>;
}

/// Remote file publication for the `<ftp>` tag.
pub trait FileTransfer: Send + Sync {
    fn upload(
        &self,
        local: &Path,
        server: &str,
        destination: &str,
        user: &str,
        password: &str,
    ) -> IslResult<()>;
}

/// One-shot done flag for asynchronous captures.
///
/// The waiting side blocks with no timeout; a grabber that never
/// signals hangs the session, matching the contract that grabbers own
/// their own failure reporting and always signal.
#[derive(Debug, Default)]
pub struct CaptureSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CaptureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_done(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self
                .condvar
                .wait(done)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn signal_done(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.condvar.notify_all();
    }
}

/// A synthetic view with a fixed size and background. Backs
/// `test="true"` captures and lets scripts run without a host
/// application.
pub struct StaticView {
    name: String,
    width: u32,
    height: u32,
    background: Rgba<u8>,
    bounds: Option<GeoBounds>,
}

impl StaticView {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            background: Rgba([255, 255, 255, 255]),
            bounds: None,
        }
    }

    pub fn with_background(mut self, background: Rgba<u8>) -> Self {
        self.background = background;
        self
    }

    /// Georeference the view with a linear lat/lon mapping.
    pub fn with_bounds(mut self, bounds: GeoBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

impl RenderableView for StaticView {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn class_name(&self) -> &str {
        "StaticView"
    }

    fn capture_frame(&self) -> IslResult<RgbaImage> {
        Ok(RgbaImage::from_pixel(self.width, self.height, self.background))
    }

    fn screen_to_geo(&self, x: f64, y: f64) -> Option<GeoPoint> {
        let b = self.bounds?;
        let lon = b.west + x / f64::from(self.width) * (b.east - b.west);
        let lat = b.north - y / f64::from(self.height) * (b.north - b.south);
        Some(GeoPoint { lat, lon })
    }

    fn geo_to_screen(&self, point: GeoPoint) -> Option<(f64, f64)> {
        let b = self.bounds?;
        let x = (point.lon - b.west) / (b.east - b.west) * f64::from(self.width);
        let y = (b.north - point.lat) / (b.north - b.south) * f64::from(self.height);
        Some((x, y))
    }

    fn animation_timestamp(&self) -> Option<i64> {
        None
    }

    fn background_color(&self) -> Rgba<u8> {
        self.background
    }

    fn color_scales(&self) -> Vec<ColorScale> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capture_signal_rendezvous() {
        let signal = Arc::new(CaptureSignal::new());
        let other = Arc::clone(&signal);
        let handle = thread::spawn(move || other.signal_done());
        signal.wait_done();
        handle.join().unwrap();
        // Already-signalled waits return immediately.
        signal.wait_done();
    }

    #[test]
    fn static_view_captures_solid_frame() {
        let view = StaticView::new("test", 4, 3).with_background(Rgba([10, 20, 30, 255]));
        let frame = view.capture_frame().unwrap();
        assert_eq!(frame.dimensions(), (4, 3));
        assert_eq!(*frame.get_pixel(2, 1), Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn static_view_geo_mapping_round_trips() {
        let bounds = GeoBounds {
            north: 50.0,
            west: -110.0,
            south: 30.0,
            east: -90.0,
        };
        let view = StaticView::new("geo", 200, 100).with_bounds(bounds);
        let point = GeoPoint { lat: 40.0, lon: -100.0 };
        let (x, y) = view.geo_to_screen(point).unwrap();
        assert_eq!((x, y), (100.0, 50.0));
        let back = view.screen_to_geo(x, y).unwrap();
        assert!((back.lat - point.lat).abs() < 1e-9);
        assert!((back.lon - point.lon).abs() < 1e-9);
    }

    #[test]
    fn ungeoreferenced_view_has_no_mapping() {
        let view = StaticView::new("plain", 10, 10);
        assert!(view.screen_to_geo(0.0, 0.0).is_none());
        assert!(view.geo_to_screen(GeoPoint { lat: 0.0, lon: 0.0 }).is_none());
    }
}
