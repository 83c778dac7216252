//! Compositing directives driven through complete scripts: clip, matte,
//! resize, split, thumbnail, transparency, overlays and color bars.

mod common;

use common::{MockEncoder, MockRegistry, MockView};
use image::{Rgba, RgbaImage};
use imagescript::{ColorScale, GeoBounds, Interpreter};

fn dims(path: &std::path::Path) -> (u32, u32) {
    let img = image::open(path).unwrap();
    (img.width(), img.height())
}

#[test]
fn matte_pads_the_frame() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("matted.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="20" height="10" file="{}">
               <matte space="5" background="black"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    assert_eq!(dims(&out), (30, 20));
    let img = image::open(&out).unwrap().to_rgba8();
    assert_eq!(*img.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
}

#[test]
fn clip_cuts_pixel_bounds() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("clipped.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="10" height="10" file="{}">
               <clip left="2" top="2" right="8" bottom="6"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    assert_eq!(dims(&out), (6, 4));
}

#[test]
fn clip_clamps_to_the_frame() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("clamped.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="10" height="10" file="{}">
               <clip left="-5" top="0" right="100" bottom="100"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    assert_eq!(dims(&out), (10, 10));
}

#[test]
fn resize_is_percent_relative_and_keeps_aspect() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("small.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="100" height="50" file="{}">
               <resize width="50%"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    assert_eq!(dims(&out), (50, 25));
}

#[test]
fn split_writes_a_tile_per_cell() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="40" height="20" file="{0}/full.png">
               <split columns="2" rows="2" file="{0}/tile_${{row}}_${{column}}.png"/>
             </image>
           </isl>"#,
        dir.path().display()
    );
    interp.process_script(&xml).unwrap();

    for row in 0..2 {
        for col in 0..2 {
            let tile = dir.path().join(format!("tile_{row}_{col}.png"));
            assert!(tile.exists(), "missing {}", tile.display());
            assert_eq!(dims(&tile), (20, 10));
        }
    }
    assert_eq!(dims(&dir.path().join("full.png")), (40, 20));
}

#[test]
fn thumbnail_derives_its_name_from_the_main_file() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("shot.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="100" height="100" file="{}">
               <thumbnail width="10"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    assert_eq!(dims(&out), (100, 100));
    assert_eq!(dims(&dir.path().join("shot_thumb.png")), (10, 10));
}

#[test]
fn transparent_knocks_out_a_color() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("holes.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="4" height="4" background="red" file="{}">
               <transparent color="red"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    let img = image::open(&out).unwrap().to_rgba8();
    assert_eq!(img.get_pixel(1, 1)[3], 0);
}

#[test]
fn image_overlay_is_blitted_at_its_anchor() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let badge = dir.path().join("badge.png");
    RgbaImage::from_pixel(3, 3, Rgba([0, 255, 0, 255]))
        .save(&badge)
        .unwrap();

    let out = dir.path().join("composed.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="20" height="20" background="black" file="{}">
               <overlay image="{}" place="ul" anchor="ul"/>
             </image>
           </isl>"#,
        out.display(),
        badge.display()
    );
    interp.process_script(&xml).unwrap();
    let img = image::open(&out).unwrap().to_rgba8();
    assert_eq!(*img.get_pixel(1, 1), Rgba([0, 255, 0, 255]));
    assert_eq!(*img.get_pixel(10, 10), Rgba([0, 0, 0, 255]));
}

#[test]
fn colorbar_draws_the_view_scale() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bar.png");
    let view = MockView::new("main", 100, 60, Rgba([255, 255, 255, 255])).with_scale(ColorScale {
        name: "temperature".to_string(),
        colors: vec![[255, 0, 0, 255], [0, 0, 255, 255]],
        range: (0.0, 10.0),
        unit: Some("C".to_string()),
    });
    let interp = Interpreter::new().with_views(MockRegistry::single(view));
    let xml = format!(
        r#"<isl>
             <image file="{}">
               <colorbar width="40" height="10" place="ul" anchor="ul"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();

    let img = image::open(&out).unwrap().to_rgba8();
    // Left half of the strip is the first ramp color, right half the second.
    assert_eq!(*img.get_pixel(5, 5), Rgba([255, 0, 0, 255]));
    assert_eq!(*img.get_pixel(35, 5), Rgba([0, 0, 255, 255]));
    // Outside the strip the captured frame shows through.
    assert_eq!(*img.get_pixel(80, 40), Rgba([255, 255, 255, 255]));
}

#[test]
fn latlonlabels_without_georeference_is_skipped() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("plain.png");
    let interp = Interpreter::new();
    let xml = format!(
        r#"<isl>
             <image test="true" width="10" height="10" file="{}">
               <latlonlabels latvalues="40" lonvalues="-100"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    assert!(out.exists());
}

#[test]
fn geographic_clip_uses_the_view_projection() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("geo.png");
    let view = MockView::new("map", 100, 100, Rgba([255, 255, 255, 255])).with_bounds(GeoBounds {
        north: 50.0,
        west: -110.0,
        south: 30.0,
        east: -90.0,
    });
    let interp = Interpreter::new().with_views(MockRegistry::single(view));
    let xml = format!(
        r#"<isl>
             <image file="{}">
               <clip north="45" south="35" west="-105" east="-95"/>
             </image>
           </isl>"#,
        out.display()
    );
    interp.process_script(&xml).unwrap();
    // The inner half of the 20x20 degree extent on a 100x100 view.
    assert_eq!(dims(&out), (50, 50));
}

#[test]
fn movie_encodes_fileset_frames() {
    common::init_tracing();
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.png");
    let b = dir.path().join("b.png");
    for path in [&a, &b] {
        RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]))
            .save(path)
            .unwrap();
    }

    let encoder = Arc::new(MockEncoder::default());
    let out = dir.path().join("out.mp4");
    let interp = Interpreter::new()
        .with_movie_encoder(Arc::clone(&encoder) as Arc<dyn imagescript::MovieEncoder>);
    let xml = format!(
        r#"<isl>
             <movie file="{}" framerate="5">
               <fileset file="{},{}"/>
             </movie>
           </isl>"#,
        out.display(),
        a.display(),
        b.display()
    );
    interp.process_script(&xml).unwrap();

    assert!(out.exists());
    let calls = encoder.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (frames, target, framerate) = &calls[0];
    assert_eq!(frames, &[a, b]);
    assert_eq!(target, &out);
    assert_eq!(*framerate, 5.0);
}

#[test]
fn movie_directives_do_not_reuse_an_earlier_captured_view() {
    common::init_tracing();
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let frame = dir.path().join("frame.png");
    RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255]))
        .save(&frame)
        .unwrap();

    let encoder = Arc::new(MockEncoder::default());
    let capture = dir.path().join("capture.png");
    let out = dir.path().join("out.mp4");
    let interp = Interpreter::new()
        .with_views(MockRegistry::single(MockView::new(
            "main",
            8,
            8,
            Rgba([0, 0, 255, 255]),
        )))
        .with_movie_encoder(Arc::clone(&encoder) as Arc<dyn imagescript::MovieEncoder>);
    let xml = format!(
        r#"<isl>
             <image file="{}"/>
             <movie file="{}">
               <fileset file="{}"/>
               <backgroundtransparent/>
             </movie>
           </isl>"#,
        capture.display(),
        out.display(),
        frame.display()
    );
    interp.process_script(&xml).unwrap();

    // With no view left over from the image tag, the blue background
    // of the frame must stay opaque.
    let processed = image::open(&frame).unwrap().to_rgba8();
    assert_eq!(processed.get_pixel(2, 2)[3], 255);
    assert!(out.exists());
}
