//! The `<image>` and `<movie>` tags: resolving target views, grabbing
//! frames and handing them to the compositing pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::error::{Flow, IslError, IslResult, Step, Unwind};
use crate::fileset;
use crate::interp::Session;
use crate::macros;
use crate::pipeline::ImageProps;
use crate::props::PropertyTable;
use crate::script::ScriptNode;
use crate::view::{CaptureSignal, RenderableView, StaticView};

/// Resolve the `view` attribute into target views.
///
/// Selectors are comma-separated: `#N` picks the Nth view (0-based, so
/// `#0` is the first), `class:...` matches the view's type name,
/// `name:...` or a bare token matches the display name (substring, then
/// as a regex). No attribute selects every view.
fn resolve_views(
    s: &Session<'_>,
    node: &ScriptNode,
) -> IslResult<Vec<Arc<dyn RenderableView>>> {
    let all: Vec<Arc<dyn RenderableView>> = s
        .interp
        .views
        .as_ref()
        .map(|r| r.views())
        .unwrap_or_default();

    let Some(selector) = s.attr(node, "view")? else {
        return Ok(all);
    };

    let mut selected = Vec::new();
    for token in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(ordinal) = token.strip_prefix('#') {
            let n: usize = ordinal.parse().map_err(|_| IslError::MacroType {
                attr: "view".to_string(),
                expected: "view ordinal (#N)",
                value: token.to_string(),
            })?;
            if let Some(view) = all.get(n) {
                selected.push(Arc::clone(view));
            }
        } else if let Some(class) = token.strip_prefix("class:") {
            selected.extend(
                all.iter()
                    .filter(|v| v.class_name().contains(class))
                    .cloned(),
            );
        } else {
            let pattern = token.strip_prefix("name:").unwrap_or(token);
            let regex = Regex::new(pattern).ok();
            selected.extend(
                all.iter()
                    .filter(|v| {
                        let name = v.name();
                        name.contains(pattern)
                            || regex.as_ref().is_some_and(|re| re.is_match(&name))
                    })
                    .cloned(),
            );
        }
    }
    Ok(selected)
}

/// A blank synthetic view for `test="true"` captures.
fn test_view(s: &Session<'_>, node: &ScriptNode) -> IslResult<Arc<dyn RenderableView>> {
    let width = s.attr_usize(node, "width", 300)? as u32;
    let height = s.attr_usize(node, "height", 300)? as u32;
    let mut view = StaticView::new("test", width.max(1), height.max(1));
    if let Some(color) = s.attr(node, "background")? {
        let background = macros::parse_color(&color).ok_or(IslError::MacroType {
            attr: "background".to_string(),
            expected: "color",
            value: color,
        })?;
        view = view.with_background(background);
    }
    Ok(Arc::new(view))
}

/// Run the pipeline for one captured frame under a per-view scope that
/// publishes `viewindex` and `viewname`.
fn process_view_frame(
    s: &mut Session<'_>,
    node: &ScriptNode,
    view: &Arc<dyn RenderableView>,
    index: usize,
    filename: Option<&str>,
) -> Result<(), Unwind> {
    s.props.push();
    let mut scope = PropertyTable::new();
    macros::put_index(&mut scope, "viewindex", index);
    let name = view.name();
    scope.insert(
        "viewname".to_string(),
        if name.is_empty() {
            format!("view{index}")
        } else {
            name
        },
    );
    for (k, v) in scope {
        s.props.put(k, v, false);
    }
    s.current_view = Some(Arc::clone(view));

    let result = (|| -> Result<(), Unwind> {
        view.wait_until_idle();
        let frame = view.capture_frame()?;
        let mut image_props = ImageProps::new();
        s.process_image(frame, filename, node, Some(view), &mut image_props)?;
        Ok(())
    })();
    s.props.pop().map_err(Unwind::Error)?;
    result
}

pub(crate) fn tag_image(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let filename = s.attr(node, "file")?;

    // A display capture bypasses view resolution entirely.
    if let Some(id) = s.attr(node, "display")? {
        let display = s
            .interp
            .displays
            .as_ref()
            .and_then(|r| r.find_display(&id))
            .ok_or_else(|| IslError::evaluation(format!("could not find display '{id}'")))?;
        let frame = display.capture_frame()?;
        let view = s.current_view.clone();
        let mut image_props = ImageProps::new();
        s.process_image(frame, filename.as_deref(), node, view.as_ref(), &mut image_props)?;
        return Ok(Flow::Proceed);
    }

    let views = if s.attr_bool(node, "test", false)? {
        vec![test_view(s, node)?]
    } else {
        resolve_views(s, node)?
    };
    if views.is_empty() {
        tracing::warn!("image tag matched no views, skipping");
        return Ok(Flow::Proceed);
    }

    // The per-view assignment must not outlive the capture loop.
    let saved_view = s.current_view.take();
    let mut step = Ok(Flow::Proceed);
    for (index, view) in views.iter().enumerate() {
        if let Err(unwind) = process_view_frame(s, node, view, index, filename.as_deref()) {
            step = Err(unwind);
            break;
        }
    }
    s.current_view = saved_view;
    step
}

pub(crate) fn tag_movie(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let file = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("movie tag requires a file"))?;
    let framerate = s.attr_f64(node, "framerate", 1.0)?;
    let end_frame_pause = match s.attr(node, "endframepause")? {
        Some(v) => Some(v.parse().map_err(|_| IslError::MacroType {
            attr: "endframepause".to_string(),
            expected: "number",
            value: v,
        })?),
        None => None,
    };

    let mut expand = |raw: &str| s.apply_macros(raw);
    let preselected = fileset::find_files(node, &mut expand)?;

    let has_directives = node
        .children
        .iter()
        .any(|c| !matches!(c.tag.as_str(), "fileset" | "output"));

    let mut sequences: Vec<(Vec<PathBuf>, Option<Arc<dyn RenderableView>>)> = Vec::new();
    if let Some(frames) = preselected {
        if frames.is_empty() {
            tracing::warn!("movie filesets matched no frames, skipping");
            return Ok(Flow::Proceed);
        }
        sequences.push((frames, s.current_view.clone()));
    } else {
        let views = if s.attr_bool(node, "test", false)? {
            vec![test_view(s, node)?]
        } else {
            resolve_views(s, node)?
        };
        if views.is_empty() {
            tracing::warn!("movie tag matched no views, skipping");
            return Ok(Flow::Proceed);
        }
        let grabber = s
            .interp
            .grabber
            .as_ref()
            .cloned()
            .ok_or_else(|| IslError::evaluation("no sequence grabber configured"))?;
        for view in views {
            let signal = Arc::new(CaptureSignal::new());
            grabber.start(Arc::clone(&view), Arc::clone(&signal))?;
            signal.wait_done();
            let frames: Vec<PathBuf> = grabber.frames().into_iter().map(|(p, _)| p).collect();
            if frames.is_empty() {
                tracing::warn!(view = %view.name(), "sequence grab produced no frames");
                continue;
            }
            sequences.push((frames, Some(view)));
        }
    }

    let encoder = s
        .interp
        .movie_encoder
        .as_ref()
        .cloned()
        .ok_or_else(|| IslError::evaluation("no movie encoder configured"))?;

    for (index, (frames, view)) in sequences.iter().enumerate() {
        if has_directives {
            // Run each frame through the pipeline in place.
            for frame_path in frames {
                let frame = image::open(frame_path)?.to_rgba8();
                let mut image_props = ImageProps::new();
                let name = frame_path.to_string_lossy().into_owned();
                s.process_image(frame, Some(&name), node, view.as_ref(), &mut image_props)?;
            }
        }

        let expanded = s.apply_macros(&file)?;
        for output in expanded.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            // Successive views get numbered outputs.
            let target = if index == 0 {
                output.to_string()
            } else {
                numbered_output(output, index)
            };
            if let Some(parent) = Path::new(&target).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            encoder.encode(frames, Path::new(&target), framerate, end_frame_pause)?;
            tracing::info!(target: "isl", output = %target, frames = frames.len(), "encoded movie");
        }
    }
    Ok(Flow::Proceed)
}

/// `out.mp4` -> `out1.mp4` for the second view's movie.
fn numbered_output(output: &str, index: usize) -> String {
    match output.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}{index}.{ext}"),
        None => format!("{output}{index}"),
    }
}
