//! The compositing pipeline: directive children of `<image>`, `<movie>`
//! and nested directives, applied in order to an in-memory frame.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage, imageops};

use crate::annotate;
use crate::error::{IslError, IslResult, Unwind};
use crate::interp::Session;
use crate::macros;
use crate::props::PropertyTable;
use crate::script::ScriptNode;
use crate::view::{ColorScale, GeoPoint, RenderableView};

/// Open metadata bag threaded through one `process_image` call: geo
/// bounds recorded by `clip`, KML fragments from `kmlcolorbar`.
pub(crate) type ImageProps = BTreeMap<String, serde_json::Value>;

/// Two-letter corner/edge code plus pixel offsets: `"ll,10,-10"`.
/// First letter is vertical (`u`pper, `m`iddle, `l`ower), second is
/// horizontal (`l`eft, `c`enter, `r`ight).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    vertical: char,
    horizontal: char,
    dx: i64,
    dy: i64,
}

impl Placement {
    pub(crate) fn parse(s: &str, attr: &str) -> IslResult<Self> {
        let bad = || IslError::MacroType {
            attr: attr.to_string(),
            expected: "placement (e.g. ll,10,-10)",
            value: s.to_string(),
        };
        let mut parts = s.split(',').map(str::trim);
        let code = parts.next().ok_or_else(bad)?;
        let mut chars = code.chars();
        let (vertical, horizontal) = (
            chars.next().ok_or_else(bad)?,
            chars.next().ok_or_else(bad)?,
        );
        if chars.next().is_some()
            || !matches!(vertical, 'u' | 'm' | 'l')
            || !matches!(horizontal, 'l' | 'c' | 'r')
        {
            return Err(bad());
        }
        let mut offset = |part: Option<&str>| -> IslResult<i64> {
            match part {
                Some(v) => v.parse().map_err(|_| bad()),
                None => Ok(0),
            }
        };
        let dx = offset(parts.next())?;
        let dy = offset(parts.next())?;
        Ok(Self {
            vertical,
            horizontal,
            dx,
            dy,
        })
    }

    /// The placement point within a `w`x`h` rectangle.
    pub(crate) fn point(&self, w: i64, h: i64) -> (i64, i64) {
        let x = match self.horizontal {
            'l' => 0,
            'c' => w / 2,
            _ => w,
        };
        let y = match self.vertical {
            'u' => 0,
            'm' => h / 2,
            _ => h,
        };
        (x + self.dx, y + self.dy)
    }
}

/// Write an image, converting to opaque RGB for formats without alpha.
pub(crate) fn write_image(path: &Path, image: &RgbaImage) -> IslResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" | "bmp" => {
            DynamicImage::ImageRgba8(image.clone())
                .to_rgb8()
                .save(path)?;
        }
        _ => image.save(path)?,
    }
    tracing::debug!(path = %path.display(), "wrote image");
    Ok(())
}

fn format_value(v: f64) -> String {
    format!("{v:.1}")
}

impl Session<'_> {
    /// Apply the directive children of `node` to `image`, then write it
    /// to `filename` (a macro-expanded comma-list) when given.
    pub(crate) fn process_image(
        &mut self,
        mut image: RgbaImage,
        filename: Option<&str>,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
        image_props: &mut ImageProps,
    ) -> Result<RgbaImage, Unwind> {
        for child in &node.children {
            let mut produced: Option<RgbaImage> = None;
            let mut iterate_children = true;

            match child.tag.as_str() {
                // Frames were resolved before the pipeline ran.
                "fileset" => continue,
                "output" => {
                    self.process_node(child)?;
                    continue;
                }
                "resize" => {
                    produced = Some(self.directive_resize(&image, child)?);
                }
                "clip" => {
                    produced = self.directive_clip(&image, child, view, image_props)?;
                }
                "matte" => {
                    produced = Some(self.directive_matte(&image, child, 0.0)?);
                }
                "transparent" | "backgroundtransparent" => {
                    produced = self.directive_transparent(&image, child, view)?;
                }
                "colorbar" | "kmlcolorbar" => {
                    produced = self.directive_colorbar(&image, child, view, image_props)?;
                }
                "latlonlabels" => {
                    produced = self.directive_latlon(&image, child, view, image_props)?;
                }
                "overlay" => {
                    self.directive_overlay(&mut image, child)?;
                }
                "write" => {
                    let file = self
                        .attr(child, "file")?
                        .ok_or_else(|| IslError::evaluation("write directive requires a file"))?;
                    write_image(Path::new(&file), &image)?;
                }
                "split" => {
                    iterate_children = false;
                    self.directive_split(&image, child, view)?;
                }
                "thumbnail" => {
                    iterate_children = false;
                    self.directive_thumbnail(&image, filename, child, view)?;
                }
                other => {
                    return Err(IslError::unknown_tag(other.to_string())
                        .at_node(child)
                        .into());
                }
            }

            if let Some(mut new_image) = produced {
                let new_file = self.attr(child, "file")?;
                if iterate_children && !child.children.is_empty() {
                    let mut nested = ImageProps::new();
                    new_image = self.process_image(
                        new_image,
                        new_file.as_deref(),
                        child,
                        view,
                        &mut nested,
                    )?;
                    image_props.append(&mut nested);
                } else if let Some(file) = &new_file {
                    write_image(Path::new(file), &new_image)?;
                }
                if !self.attr_bool(child, "copy", false)? {
                    image = new_image;
                }
            }
        }

        if let Some(filename) = filename {
            let expanded = self.apply_macros(filename)?;
            for file in expanded.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                write_image(Path::new(file), &image)?;
            }
        }
        self.last_image = Some(image.clone());
        Ok(image)
    }

    fn directive_resize(&self, image: &RgbaImage, node: &ScriptNode) -> IslResult<RgbaImage> {
        let (w, h) = (f64::from(image.width()), f64::from(image.height()));
        let width = self.attr_rel_f64(node, "width", w, -1.0)?;
        let height = self.attr_rel_f64(node, "height", h, -1.0)?;
        // A single dimension keeps the aspect ratio.
        let (new_w, new_h) = match (width > 0.0, height > 0.0) {
            (true, true) => (width, height),
            (true, false) => (width, h * width / w),
            (false, true) => (w * height / h, height),
            (false, false) => (w, h),
        };
        Ok(imageops::resize(
            image,
            (new_w.round() as u32).max(1),
            (new_h.round() as u32).max(1),
            FilterType::Triangle,
        ))
    }

    fn directive_clip(
        &self,
        image: &RgbaImage,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
        image_props: &mut ImageProps,
    ) -> Result<Option<RgbaImage>, Unwind> {
        let width = f64::from(image.width());
        let height = f64::from(image.height());

        let corners: Option<((f64, f64), (f64, f64))> = if let Some(id) =
            self.attr(node, "display")?
        {
            let display = self
                .interp
                .displays
                .as_ref()
                .and_then(|r| r.find_display(&id))
                .ok_or_else(|| IslError::evaluation(format!("could not find display '{id}'")))?;
            let bounds = display.geo_bounds().ok_or_else(|| {
                IslError::evaluation(format!("display '{id}' has no geographic bounds"))
            })?;
            let view = require_view(view, "clip display=")?;
            record_bounds(image_props, bounds.north, bounds.west, bounds.south, bounds.east);
            Some(project_corners(view, bounds.north, bounds.west, bounds.south, bounds.east)?)
        } else if node.has_attr("north") {
            let view = require_view(view, "geographic clip")?;
            let north = self.attr_f64(node, "north", 0.0)?;
            let west = self.attr_f64(node, "west", 0.0)?;
            let south = self.attr_f64(node, "south", 0.0)?;
            let east = self.attr_f64(node, "east", 0.0)?;
            record_bounds(image_props, north, west, south, east);
            Some(project_corners(view, north, west, south, east)?)
        } else if node.has_attr("left") || node.has_attr("top") {
            let left = self.attr_rel_f64(node, "left", width, 0.0)?;
            let top = self.attr_rel_f64(node, "top", height, 0.0)?;
            let right = self.attr_rel_f64(node, "right", width, width)?;
            let bottom = self.attr_rel_f64(node, "bottom", height, height)?;
            Some(((left, top), (right, bottom)))
        } else if view.is_some() {
            // Whole viewport, grown outward by the space insets.
            let space = self.attr_f64(node, "space", 0.0)?;
            let hspace = self.attr_f64(node, "hspace", space)?;
            let vspace = self.attr_f64(node, "vspace", space)?;
            let left = -self.attr_f64(node, "space_left", hspace)?;
            let top = -self.attr_f64(node, "space_top", vspace)?;
            let right = width + self.attr_f64(node, "space_right", hspace)?;
            let bottom = height + self.attr_f64(node, "space_bottom", vspace)?;
            Some(((left, top), (right, bottom)))
        } else {
            tracing::warn!("clip directive needs a view or pixel bounds, skipping");
            None
        };

        // kml.* attributes override the recorded bounds.
        for edge in ["north", "south", "east", "west"] {
            if let Some(value) = self.attr(node, &format!("kml.{edge}"))? {
                let parsed: f64 = value.parse().map_err(|_| IslError::MacroType {
                    attr: format!("kml.{edge}"),
                    expected: "number",
                    value,
                })?;
                image_props.insert(edge.to_string(), serde_json::json!(parsed));
            }
        }

        let Some(((x0, y0), (x1, y1))) = corners else {
            return Ok(None);
        };
        let x0 = x0.clamp(0.0, width) as u32;
        let y0 = y0.clamp(0.0, height) as u32;
        let x1 = x1.clamp(0.0, width) as u32;
        let y1 = y1.clamp(0.0, height) as u32;
        let (x0, x1) = (x0.min(x1), x0.max(x1));
        let (y0, y1) = (y0.min(y1), y0.max(y1));
        let clipped =
            imageops::crop_imm(image, x0, y0, (x1 - x0).max(1), (y1 - y0).max(1)).to_image();
        Ok(Some(clipped))
    }

    /// Space-style insets: `space` sets all four, `hspace`/`vspace`
    /// split it, explicit edges win.
    fn insets(&self, node: &ScriptNode, default_space: f64) -> IslResult<(i64, i64, i64, i64)> {
        let space = self.attr_f64(node, "space", default_space)?;
        let hspace = self.attr_f64(node, "hspace", space)?;
        let vspace = self.attr_f64(node, "vspace", space)?;
        let top = self.attr_f64(node, "top", vspace)? as i64;
        let bottom = self.attr_f64(node, "bottom", vspace)? as i64;
        let left = self.attr_f64(node, "left", hspace)? as i64;
        let right = self.attr_f64(node, "right", hspace)? as i64;
        Ok((top, left, bottom, right))
    }

    fn directive_matte(
        &self,
        image: &RgbaImage,
        node: &ScriptNode,
        default_space: f64,
    ) -> IslResult<RgbaImage> {
        let (top, left, bottom, right) = self.insets(node, default_space)?;
        let background = self.attr_color(node, "background", Rgba([255, 255, 255, 255]))?;
        Ok(matte(image, top, left, bottom, right, background))
    }

    fn directive_transparent(
        &self,
        image: &RgbaImage,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
    ) -> Result<Option<RgbaImage>, Unwind> {
        let color = if node.tag == "backgroundtransparent" {
            match view {
                Some(view) => view.background_color(),
                None => {
                    tracing::warn!("backgroundtransparent needs a view, skipping");
                    return Ok(None);
                }
            }
        } else {
            self.attr_color(node, "color", Rgba([0, 0, 0, 0]))?
        };
        let mut out = image.clone();
        for px in out.pixels_mut() {
            if px[0] == color[0] && px[1] == color[1] && px[2] == color[2] {
                *px = Rgba([px[0], px[1], px[2], 0]);
            }
        }
        Ok(Some(out))
    }

    fn directive_colorbar(
        &mut self,
        image: &RgbaImage,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
        image_props: &mut ImageProps,
    ) -> Result<Option<RgbaImage>, Unwind> {
        let for_kml = node.tag == "kmlcolorbar";

        let mut scales: Vec<ColorScale> = if let Some(id) = self.attr(node, "display")? {
            let display = self
                .interp
                .displays
                .as_ref()
                .and_then(|r| r.find_display(&id))
                .ok_or_else(|| IslError::evaluation(format!("could not find display '{id}'")))?;
            display.color_scales()
        } else if let Some(view) = view {
            view.color_scales()
        } else {
            tracing::warn!("colorbar directive needs a view or display, skipping");
            return Ok(None);
        };
        // One strip per distinct scale/range pair.
        let mut seen = BTreeSet::new();
        scales.retain(|scale| seen.insert((scale.name.clone(), format!("{:?}", scale.range))));
        if scales.is_empty() {
            return Ok(None);
        }

        let width = self.attr_rel_f64(node, "width", f64::from(image.width()), 150.0)? as i64;
        let height = self.attr_rel_f64(node, "height", f64::from(image.height()), 20.0)? as i64;
        let ticks = self.attr_usize(node, "tickmarks", 0)?;
        let interval = self.attr_f64(node, "interval", -1.0)?;
        let values_attr = self.attr(node, "values")?;
        let color = self.attr_color(node, "color", Rgba([0, 0, 0, 255]))?;
        let line_color = self.attr_color(node, "linecolor", color)?;
        let show_lines = self.attr_bool(node, "showlines", false)?;
        let font_size = self.attr_f64(node, "fontsize", 12.0)? as f32;
        let orientation = self.attr_or(node, "orientation", "bottom")?;
        let vertical = orientation == "left" || orientation == "right";

        let place = Placement::parse(&self.attr_or(node, "place", "ll,10,-10")?, "place")?;
        let anchor = Placement::parse(&self.attr_or(node, "anchor", "ll")?, "anchor")?;
        let pp = place.point(i64::from(image.width()), i64::from(image.height()));
        let ap = anchor.point(width, height);
        let mut base_x = pp.0 - ap.0;
        let mut base_y = pp.1 - ap.1 + if vertical { 0 } else { height };

        let suffix_frequency = self.attr_or(node, "suffixfrequency", "false")?.to_lowercase();
        let suffix_template = self.attr_or(
            node,
            "suffix",
            if suffix_frequency == "false" { "" } else { " %unit%" },
        )?;

        let mut working: Option<RgbaImage> = None;
        for (scale_idx, scale) in scales.iter().enumerate() {
            let strip_rect = if for_kml {
                (0, 0, width, height)
            } else if vertical {
                (base_x, base_y, base_x + width, base_y + height)
            } else {
                (base_x, base_y - height, base_x + width, base_y)
            };

            let mut canvas = if for_kml {
                let background =
                    self.attr_color(node, "background", Rgba([255, 255, 255, 255]))?;
                RgbaImage::from_pixel(width.max(1) as u32, height.max(1) as u32, background)
            } else {
                working.take().unwrap_or_else(|| image.clone())
            };

            annotate::draw_color_ramp(
                &mut canvas,
                strip_rect.0,
                strip_rect.1,
                strip_rect.2,
                strip_rect.3,
                &scale.colors,
                vertical,
            );
            if show_lines {
                annotate::draw_rect(
                    &mut canvas,
                    strip_rect.0,
                    strip_rect.1,
                    strip_rect.2,
                    strip_rect.3,
                    1,
                    line_color,
                );
            }

            let (min, max) = scale.range;
            let mut values: Vec<f64> = Vec::new();
            if let Some(values_attr) = &values_attr {
                for token in values_attr.split(',') {
                    let token = token.trim();
                    values.push(token.parse().map_err(|_| IslError::MacroType {
                        attr: "values".to_string(),
                        expected: "number",
                        value: token.to_string(),
                    })?);
                }
            } else if ticks > 0 {
                for tick in 0..ticks {
                    let percent = if ticks > 1 {
                        tick as f64 / (ticks - 1) as f64
                    } else {
                        0.0
                    };
                    values.push(min + percent * (max - min));
                }
            } else if interval > 0.0 {
                let mut value = min;
                while value <= max {
                    values.push(value);
                    value += interval;
                }
            }

            let suffix = match &scale.unit {
                Some(unit) => suffix_template.replace("%unit%", unit),
                None => suffix_template.replace("%unit%", ""),
            };
            let span = if vertical { height } else { width };
            for (value_idx, value) in values.iter().enumerate() {
                let percent = if max > min { (value - min) / (max - min) } else { 0.0 };
                let along = (percent * span as f64) as i64;
                if along > span {
                    break;
                }
                let (x, y) = if vertical {
                    let x = if orientation == "right" {
                        strip_rect.2
                    } else {
                        strip_rect.0
                    };
                    (x, strip_rect.1 + along)
                } else {
                    let y = if orientation == "bottom" {
                        strip_rect.3
                    } else {
                        strip_rect.1
                    };
                    (strip_rect.0 + along, y)
                };

                let mut label = format_value(*value);
                let with_suffix = match suffix_frequency.as_str() {
                    "first" => value_idx == 0,
                    "last" => value_idx == values.len() - 1,
                    "all" | "true" => true,
                    _ => false,
                };
                if with_suffix {
                    label.push_str(&suffix);
                }

                match orientation.as_str() {
                    "right" => annotate::draw_line(&mut canvas, x + 1, y, x, y, line_color),
                    "left" => annotate::draw_line(&mut canvas, x - 1, y, x, y, line_color),
                    "bottom" => annotate::draw_line(&mut canvas, x, y + 1, x, y, line_color),
                    _ => annotate::draw_line(&mut canvas, x, y - 1, x, y, line_color),
                }

                if let Some(text) = self.text.render(&label, font_size, color)? {
                    let (tw, th) = (i64::from(text.width()), i64::from(text.height()));
                    let (lx, ly) = match orientation.as_str() {
                        "right" => (x + 2, y - th / 2),
                        "left" => (x - 2 - tw, y - th / 2),
                        "bottom" => (x - tw / 2, y + 2),
                        _ => (x - tw / 2, y - th - 2),
                    };
                    annotate::blit_over(&mut canvas, &text, lx, ly);
                }
            }

            if for_kml {
                let default_file = format!("colorbar{scale_idx}.png");
                let file = self.attr_or(node, "file", &default_file)?;
                write_image(Path::new(&file), &canvas)?;
                self.record_kml_overlay(node, &file, image_props)?;
            } else {
                working = Some(canvas);
                if vertical {
                    base_x += width + 30;
                } else {
                    base_y += height + 30;
                }
            }
        }

        Ok(working)
    }

    /// Record a KML ScreenOverlay fragment and its strip image so the
    /// enclosing capture can assemble them later.
    fn record_kml_overlay(
        &self,
        node: &ScriptNode,
        file: &str,
        image_props: &mut ImageProps,
    ) -> IslResult<()> {
        let defaults = [
            ("kml.name", ""),
            ("kml.overlayXY.x", "0"),
            ("kml.overlayXY.y", "1"),
            ("kml.overlayXY.xunits", "fraction"),
            ("kml.overlayXY.yunits", "fraction"),
            ("kml.screenXY.x", "0"),
            ("kml.screenXY.y", "1"),
            ("kml.screenXY.xunits", "fraction"),
            ("kml.screenXY.yunits", "fraction"),
            ("kml.size.x", "-1"),
            ("kml.size.y", "-1"),
            ("kml.size.xunits", "pixels"),
            ("kml.size.yunits", "pixels"),
        ];
        let mut fragment = String::from(
            "<ScreenOverlay><name>${kml.name}</name><Icon><href>${icon}</href></Icon>\n\
             <overlayXY x=\"${kml.overlayXY.x}\" y=\"${kml.overlayXY.y}\" xunits=\"${kml.overlayXY.xunits}\" yunits=\"${kml.overlayXY.yunits}\"/>\n\
             <screenXY x=\"${kml.screenXY.x}\" y=\"${kml.screenXY.y}\" xunits=\"${kml.screenXY.xunits}\" yunits=\"${kml.screenXY.yunits}\"/>\n\
             <size x=\"${kml.size.x}\" y=\"${kml.size.y}\" xunits=\"${kml.size.xunits}\" yunits=\"${kml.size.yunits}\"/>\n\
             </ScreenOverlay>\n",
        );
        for (name, default) in defaults {
            let value = self.attr_or(node, name, default)?;
            fragment = fragment.replace(&format!("${{{name}}}"), &value);
        }
        let icon = Path::new(file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        fragment = fragment.replace("${icon}", &icon);

        let existing = image_props
            .entry("kml".to_string())
            .or_insert_with(|| serde_json::json!(""));
        if let Some(text) = existing.as_str() {
            *existing = serde_json::json!(format!("{text}{fragment}"));
        }
        let files = image_props
            .entry("kmlfiles".to_string())
            .or_insert_with(|| serde_json::json!([]));
        if let Some(list) = files.as_array_mut() {
            list.push(serde_json::json!(file));
        }
        Ok(())
    }

    fn directive_latlon(
        &mut self,
        image: &RgbaImage,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
        image_props: &ImageProps,
    ) -> Result<Option<RgbaImage>, Unwind> {
        let Some(view) = view else {
            tracing::warn!("latlonlabels directive needs a view, skipping");
            return Ok(None);
        };

        let color = self.attr_color(node, "color", Rgba([255, 0, 0, 255]))?;
        let line_color = self.attr_color(node, "linecolor", color)?;
        let label_bg = match self.attr(node, "labelbackground")? {
            Some(v) => macros::parse_color(&v),
            None => None,
        };
        let font_size = self.attr_f64(node, "fontsize", 12.0)? as f32;

        let lat_values = self.number_list(node, "latvalues")?;
        let lon_values = self.number_list(node, "lonvalues")?;
        let lat_labels = self.string_list(node, "latlabels")?;
        let lon_labels = self.string_list(node, "lonlabels")?;

        let draw_lon_lines = self.attr_bool(node, "drawlonlines", false)?;
        let draw_lat_lines = self.attr_bool(node, "drawlatlines", false)?;
        let show_top = self.attr_bool(node, "showtop", false)?;
        let show_bottom = self.attr_bool(node, "showbottom", true)?;
        let show_left = self.attr_bool(node, "showleft", true)?;
        let show_right = self.attr_bool(node, "showright", false)?;

        let width = i64::from(image.width());
        let height = i64::from(image.height());

        // Bounds recorded by an earlier clip win over the projection.
        let (north, west, south, east) = match bounds_from_props(image_props) {
            Some(bounds) => bounds,
            None => {
                let nw = view.screen_to_geo(0.0, 0.0);
                let se = view.screen_to_geo(width as f64, height as f64);
                match (nw, se) {
                    (Some(nw), Some(se)) => (nw.lat, nw.lon, se.lat, se.lon),
                    _ => {
                        tracing::warn!("view has no geographic mapping, skipping latlonlabels");
                        return Ok(None);
                    }
                }
            }
        };
        let width_degrees = east - west;
        let height_degrees = north - south;

        let (top, left, bottom, right) = self.insets(node, 0.0)?;
        let mut canvas = self.directive_matte(image, node, 0.0)?;
        let offset_top = self.attr_f64(node, "lineoffsettop", 0.0)? as i64;
        let offset_bottom = self.attr_f64(node, "lineoffsetbottom", 0.0)? as i64;
        let offset_left = self.attr_f64(node, "lineoffsetleft", 0.0)? as i64;
        let offset_right = self.attr_f64(node, "lineoffsetright", 0.0)? as i64;
        let delta = 2;
        let bg_pad = 1;

        for (i, lon) in lon_values.iter().enumerate() {
            if width_degrees == 0.0 {
                break;
            }
            let percent = (lon - west) / width_degrees;
            let base_x = left + (percent * width as f64) as i64;
            let label = lon_labels
                .get(i)
                .cloned()
                .unwrap_or_else(|| format_value(*lon));
            if draw_lon_lines {
                annotate::draw_line(
                    &mut canvas,
                    base_x,
                    top + offset_top,
                    base_x,
                    top + height - offset_bottom,
                    line_color,
                );
            }
            let Some(text) = self.text.render(&label, font_size, color)? else {
                continue;
            };
            let (tw, th) = (i64::from(text.width()), i64::from(text.height()));
            let x = base_x - tw / 2;
            if show_top {
                let top_y = if top == 0 { delta } else { top - delta - th };
                if let Some(bg) = label_bg {
                    annotate::fill_rect(
                        &mut canvas,
                        x - bg_pad,
                        top_y - bg_pad,
                        x + tw + bg_pad,
                        top_y + th + bg_pad,
                        bg,
                    );
                }
                annotate::blit_over(&mut canvas, &text, x, top_y);
            }
            if show_bottom {
                let bottom_y = if bottom == 0 {
                    top + height - delta - th
                } else {
                    top + height + delta
                };
                if let Some(bg) = label_bg {
                    annotate::fill_rect(
                        &mut canvas,
                        x - bg_pad,
                        bottom_y - bg_pad,
                        x + tw + bg_pad,
                        bottom_y + th + bg_pad,
                        bg,
                    );
                }
                annotate::blit_over(&mut canvas, &text, x, bottom_y);
            }
        }

        for (i, lat) in lat_values.iter().enumerate() {
            if height_degrees == 0.0 {
                break;
            }
            let percent = 1.0 - (lat - south) / height_degrees;
            let base_y = top + (percent * height as f64) as i64;
            let label = lat_labels
                .get(i)
                .cloned()
                .unwrap_or_else(|| format_value(*lat));
            if draw_lat_lines {
                annotate::draw_line(
                    &mut canvas,
                    left + offset_left,
                    base_y,
                    left + width - offset_right,
                    base_y,
                    line_color,
                );
            }
            let Some(text) = self.text.render(&label, font_size, color)? else {
                continue;
            };
            let (tw, th) = (i64::from(text.width()), i64::from(text.height()));
            let y = base_y - th / 2;
            if show_left {
                let left_x = if left == 0 { delta } else { left - tw - delta };
                if let Some(bg) = label_bg {
                    annotate::fill_rect(
                        &mut canvas,
                        left_x - bg_pad,
                        y - bg_pad,
                        left_x + tw + bg_pad,
                        y + th + bg_pad,
                        bg,
                    );
                }
                annotate::blit_over(&mut canvas, &text, left_x, y);
            }
            if show_right {
                let right_x = if right == 0 {
                    left + width - tw - delta
                } else {
                    left + width + delta
                };
                if let Some(bg) = label_bg {
                    annotate::fill_rect(
                        &mut canvas,
                        right_x - bg_pad,
                        y - bg_pad,
                        right_x + tw + bg_pad,
                        y + th + bg_pad,
                        bg,
                    );
                }
                annotate::blit_over(&mut canvas, &text, right_x, y);
            }
        }

        Ok(Some(canvas))
    }

    fn directive_overlay(
        &mut self,
        image: &mut RgbaImage,
        node: &ScriptNode,
    ) -> Result<(), Unwind> {
        let transparency = self.attr_f64(node, "transparency", 0.0)?.clamp(0.0, 1.0);
        let alpha = ((1.0 - transparency) * 255.0).round() as u8;
        let place = Placement::parse(&self.attr_or(node, "place", "lr,-10,-10")?, "place")?;
        let anchor = Placement::parse(&self.attr_or(node, "anchor", "lr,-10,-10")?, "anchor")?;
        let pp = place.point(i64::from(image.width()), i64::from(image.height()));
        let background = match self.attr(node, "background")? {
            Some(v) => macros::parse_color(&v),
            None => None,
        };

        if let Some(text) = self.attr(node, "text")? {
            let angle = self.attr_f64(node, "angle", 0.0)?;
            let mut color = self.attr_color(node, "color", Rgba([255, 255, 255, 255]))?;
            if transparency > 0.0 {
                color[3] = alpha;
            }
            let font_size = self.attr_f64(node, "fontsize", 12.0)? as f32;
            if let Some(mut rendered) = self.text.render(&text, font_size, color)? {
                if let Some(mut bg) = background {
                    if transparency > 0.0 {
                        bg[3] = alpha;
                    }
                    let mut boxed =
                        RgbaImage::from_pixel(rendered.width() + 2, rendered.height() + 2, bg);
                    annotate::blit_over(&mut boxed, &rendered, 1, 1);
                    rendered = boxed;
                }
                if angle != 0.0 {
                    rendered = annotate::rotate(&rendered, angle);
                }
                let ap = anchor.point(i64::from(rendered.width()), i64::from(rendered.height()));
                annotate::blit_over(image, &rendered, pp.0 - ap.0, pp.1 - ap.1);
            }
        }

        if let Some(path) = self.attr(node, "image")? {
            let mut overlay = image::open(&path)?.to_rgba8();
            if transparency > 0.0 {
                for px in overlay.pixels_mut() {
                    px[3] = ((u32::from(px[3]) * u32::from(alpha)) / 255) as u8;
                }
            }
            let ap = anchor.point(i64::from(overlay.width()), i64::from(overlay.height()));
            annotate::blit_over(image, &overlay, pp.0 - ap.0, pp.1 - ap.1);
        }
        Ok(())
    }

    fn directive_split(
        &mut self,
        image: &RgbaImage,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
    ) -> Result<(), Unwind> {
        let cols = self.attr_usize(node, "columns", 2)?.max(1) as u32;
        let rows = self.attr_usize(node, "rows", 2)?.max(1) as u32;
        // Kept raw: the row/column/count macros only exist per tile.
        let file = node
            .attr("file")
            .ok_or_else(|| IslError::evaluation("split directive requires a file"))?
            .to_string();
        let tile_w = (image.width() / cols).max(1);
        let tile_h = (image.height() / rows).max(1);

        let mut count = 0usize;
        for row in 0..rows {
            for col in 0..cols {
                count += 1;
                self.props.push();
                self.props.put("row", row.to_string(), false);
                self.props.put("column", col.to_string(), false);
                self.props.put("count", count.to_string(), false);
                let result = (|| -> Result<(), Unwind> {
                    let mut extra = PropertyTable::new();
                    extra.insert("row".to_string(), row.to_string());
                    extra.insert("column".to_string(), col.to_string());
                    extra.insert("count".to_string(), count.to_string());
                    let tile_file = self.apply_macros_with(&file, Some(&extra))?;
                    let tile =
                        imageops::crop_imm(image, col * tile_w, row * tile_h, tile_w, tile_h)
                            .to_image();
                    let mut nested = ImageProps::new();
                    self.process_image(tile, Some(&tile_file), node, view, &mut nested)?;
                    Ok(())
                })();
                self.props.pop().map_err(Unwind::Error)?;
                result?;
            }
        }
        Ok(())
    }

    fn directive_thumbnail(
        &mut self,
        image: &RgbaImage,
        filename: Option<&str>,
        node: &ScriptNode,
        view: Option<&Arc<dyn RenderableView>>,
    ) -> Result<(), Unwind> {
        let thumb = self.directive_resize(image, node)?;
        let file = match self.attr(node, "file")? {
            Some(file) => file,
            None => {
                let Some(filename) = filename else {
                    return Err(IslError::evaluation(
                        "thumbnail directive needs a file or an enclosing filename",
                    )
                    .into());
                };
                derive_thumbnail_name(filename)
            }
        };
        let mut nested = ImageProps::new();
        self.process_image(thumb, Some(&file), node, view, &mut nested)?;
        Ok(())
    }

    fn number_list(&self, node: &ScriptNode, name: &str) -> IslResult<Vec<f64>> {
        let Some(raw) = self.attr(node, name)? else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse().map_err(|_| IslError::MacroType {
                    attr: name.to_string(),
                    expected: "number",
                    value: t.to_string(),
                })
            })
            .collect()
    }

    fn string_list(&self, node: &ScriptNode, name: &str) -> IslResult<Vec<String>> {
        Ok(self
            .attr(node, name)?
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Insert `_thumb` before the extension: `out.png` -> `out_thumb.png`.
fn derive_thumbnail_name(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_thumb.{ext}"),
        None => format!("{filename}_thumb"),
    }
}

fn matte(
    image: &RgbaImage,
    top: i64,
    left: i64,
    bottom: i64,
    right: i64,
    background: Rgba<u8>,
) -> RgbaImage {
    let top = top.max(0) as u32;
    let left = left.max(0) as u32;
    let bottom = bottom.max(0) as u32;
    let right = right.max(0) as u32;
    let mut out = RgbaImage::from_pixel(
        image.width() + left + right,
        image.height() + top + bottom,
        background,
    );
    annotate::blit_over(&mut out, image, i64::from(left), i64::from(top));
    out
}

fn require_view<'a>(
    view: Option<&'a Arc<dyn RenderableView>>,
    what: &str,
) -> IslResult<&'a Arc<dyn RenderableView>> {
    view.ok_or_else(|| IslError::evaluation(format!("{what} requires a view")))
}

fn project_corners(
    view: &Arc<dyn RenderableView>,
    north: f64,
    west: f64,
    south: f64,
    east: f64,
) -> IslResult<((f64, f64), (f64, f64))> {
    let ul = view
        .geo_to_screen(GeoPoint { lat: north, lon: west })
        .ok_or_else(|| IslError::evaluation("view has no geographic mapping"))?;
    let lr = view
        .geo_to_screen(GeoPoint { lat: south, lon: east })
        .ok_or_else(|| IslError::evaluation("view has no geographic mapping"))?;
    Ok((ul, lr))
}

fn record_bounds(image_props: &mut ImageProps, north: f64, west: f64, south: f64, east: f64) {
    image_props.insert("north".to_string(), serde_json::json!(north));
    image_props.insert("west".to_string(), serde_json::json!(west));
    image_props.insert("south".to_string(), serde_json::json!(south));
    image_props.insert("east".to_string(), serde_json::json!(east));
}

fn bounds_from_props(image_props: &ImageProps) -> Option<(f64, f64, f64, f64)> {
    let get = |key: &str| image_props.get(key).and_then(serde_json::Value::as_f64);
    Some((get("north")?, get("west")?, get("south")?, get("east")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_codes_resolve_against_rectangle() {
        let ll = Placement::parse("ll,10,-10", "place").unwrap();
        assert_eq!(ll.point(100, 50), (10, 40));
        let uc = Placement::parse("uc", "place").unwrap();
        assert_eq!(uc.point(100, 50), (50, 0));
        let mr = Placement::parse("mr,-5", "place").unwrap();
        assert_eq!(mr.point(100, 50), (95, 25));
    }

    #[test]
    fn bad_placement_is_a_typed_error() {
        assert!(matches!(
            Placement::parse("xx", "place"),
            Err(IslError::MacroType { .. })
        ));
        assert!(matches!(
            Placement::parse("ll,abc", "anchor"),
            Err(IslError::MacroType { .. })
        ));
    }

    #[test]
    fn thumbnail_names_derive_from_the_main_file() {
        assert_eq!(derive_thumbnail_name("out.png"), "out_thumb.png");
        assert_eq!(
            derive_thumbnail_name("frames/a.b.jpg"),
            "frames/a.b_thumb.jpg"
        );
        assert_eq!(derive_thumbnail_name("noext"), "noext_thumb");
    }

    #[test]
    fn matte_grows_and_fills() {
        let base = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        let out = matte(&base, 2, 3, 4, 5, Rgba([255, 255, 255, 255]));
        assert_eq!(out.dimensions(), (12, 10));
        assert_eq!(*out.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        assert_eq!(*out.get_pixel(3, 2), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn bounds_round_trip_through_props() {
        let mut props = ImageProps::new();
        record_bounds(&mut props, 50.0, -110.0, 30.0, -90.0);
        assert_eq!(
            bounds_from_props(&props),
            Some((50.0, -110.0, 30.0, -90.0))
        );
        assert_eq!(bounds_from_props(&ImageProps::new()), None);
    }
}
