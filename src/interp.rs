//! The ISL tree-walking interpreter: one `Interpreter` per embedding,
//! one `Session` per script run.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use image::RgbaImage;

use crate::annotate::TextRasterizer;
use crate::error::{Flow, IslError, IslResult, Step, Unwind};
use crate::fileset;
use crate::macros::{self, MacroContext};
use crate::props::{PropertyStack, PropertyTable};
use crate::script::{ScriptNode, parse_script};
use crate::view::{
    DataSourceRegistry, DisplayRegistry, FileTransfer, MovieEncoder, Prompter, RenderableView,
    ScriptEvaluator, SequenceGrabber, ViewRegistry,
};

/// Script engine wired to a host application through collaborator
/// traits. Collaborators are all optional; tags that need a missing one
/// fail with an evaluation error when reached.
#[derive(Default)]
pub struct Interpreter {
    pub(crate) views: Option<Arc<dyn ViewRegistry>>,
    pub(crate) displays: Option<Arc<dyn DisplayRegistry>>,
    pub(crate) evaluator: Option<Arc<dyn ScriptEvaluator>>,
    pub(crate) movie_encoder: Option<Arc<dyn MovieEncoder>>,
    pub(crate) grabber: Option<Arc<dyn SequenceGrabber>>,
    pub(crate) prompter: Option<Arc<dyn Prompter>>,
    pub(crate) data_sources: Option<Arc<dyn DataSourceRegistry>>,
    pub(crate) file_transfer: Option<Arc<dyn FileTransfer>>,
    pub(crate) font_bytes: Option<Vec<u8>>,
    pub(crate) app_props: PropertyTable,
    active: AtomicBool,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_views(mut self, views: Arc<dyn ViewRegistry>) -> Self {
        self.views = Some(views);
        self
    }

    pub fn with_displays(mut self, displays: Arc<dyn DisplayRegistry>) -> Self {
        self.displays = Some(displays);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_movie_encoder(mut self, encoder: Arc<dyn MovieEncoder>) -> Self {
        self.movie_encoder = Some(encoder);
        self
    }

    pub fn with_sequence_grabber(mut self, grabber: Arc<dyn SequenceGrabber>) -> Self {
        self.grabber = Some(grabber);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_data_sources(mut self, registry: Arc<dyn DataSourceRegistry>) -> Self {
        self.data_sources = Some(registry);
        self
    }

    pub fn with_file_transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.file_transfer = Some(transfer);
        self
    }

    /// Font used for text annotations; without one, text drawing is
    /// skipped with a warning.
    pub fn with_font_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.font_bytes = Some(bytes);
        self
    }

    /// Define a global application property visible to every session.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.app_props.insert(key.into(), value.into());
    }

    /// Run a script from a path, or from inline XML with the `xml:`
    /// prefix. File scripts publish the script directory as `islpath`.
    #[tracing::instrument(skip(self), fields(source = %source.as_ref().display()))]
    pub fn process_script_file(&self, source: impl AsRef<Path>) -> IslResult<()> {
        let source = source.as_ref();
        let text = source.to_string_lossy();
        if let Some(xml) = text.strip_prefix("xml:") {
            return self.process_script(xml);
        }
        let xml = std::fs::read_to_string(source)?;
        let islpath = source
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty());
        self.run(&xml, islpath)
    }

    /// Run a script from XML text.
    #[tracing::instrument(skip_all)]
    pub fn process_script(&self, xml: &str) -> IslResult<()> {
        self.run(xml, None)
    }

    fn run(&self, xml: &str, islpath: Option<String>) -> IslResult<()> {
        let root = parse_script(xml)?;

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IslError::SessionActive);
        }
        let _guard = ActiveGuard(&self.active);

        let mut session = Session::new(self);
        if let Some(path) = islpath {
            session.props.put("islpath", path, true);
        }
        match session.process_node(&root) {
            Ok(_) => Ok(()),
            // Stray signals at the top are planned early termination.
            Err(Unwind::Break | Unwind::Continue | Unwind::Return | Unwind::Quit) => Ok(()),
            Err(Unwind::Error(e)) => Err(e),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-key text buffer accumulation for one open `<output>` tag.
pub(crate) struct OutputContext {
    node: ScriptNode,
    buffers: BTreeMap<String, String>,
    item_templates: BTreeMap<String, String>,
}

impl OutputContext {
    fn new(node: ScriptNode) -> Self {
        Self {
            node,
            buffers: BTreeMap::new(),
            item_templates: BTreeMap::new(),
        }
    }
}

/// State for one script run.
pub(crate) struct Session<'i> {
    pub(crate) interp: &'i Interpreter,
    pub(crate) props: PropertyStack,
    pub(crate) procs: BTreeMap<String, ScriptNode>,
    pub(crate) outputs: Vec<OutputContext>,
    pub(crate) data_source_ids: BTreeMap<String, String>,
    pub(crate) loop_index: usize,
    pub(crate) current_view: Option<Arc<dyn RenderableView>>,
    pub(crate) last_image: Option<RgbaImage>,
    pub(crate) text: TextRasterizer,
    pub(crate) debug: bool,
}

impl<'i> Session<'i> {
    fn new(interp: &'i Interpreter) -> Self {
        let mut text = TextRasterizer::new();
        if let Some(bytes) = &interp.font_bytes
            && let Err(e) = text.set_font_bytes(bytes.clone())
        {
            tracing::warn!(error = %e, "ignoring unusable font bytes");
        }
        Self {
            interp,
            props: PropertyStack::new(),
            procs: BTreeMap::new(),
            outputs: Vec::new(),
            data_source_ids: BTreeMap::new(),
            loop_index: 0,
            current_view: None,
            last_image: None,
            text,
            debug: false,
        }
    }

    // ---- macro plumbing -------------------------------------------------

    pub(crate) fn apply_macros(&self, raw: &str) -> IslResult<String> {
        self.apply_macros_with(raw, None)
    }

    pub(crate) fn apply_macros_with(
        &self,
        raw: &str,
        extra: Option<&PropertyTable>,
    ) -> IslResult<String> {
        let effective = self.props.effective();
        let ctx = MacroContext {
            props: &effective,
            extra,
            app_props: &self.interp.app_props,
            loop_index: self.loop_index,
            now_epoch: now_epoch(),
            anim_epoch: self
                .current_view
                .as_ref()
                .and_then(|v| v.animation_timestamp()),
            evaluator: self.interp.evaluator.as_deref(),
        };
        macros::expand(raw, &ctx)
    }

    /// A node attribute, macro-expanded.
    pub(crate) fn attr(&self, node: &ScriptNode, name: &str) -> IslResult<Option<String>> {
        node.attr(name).map(|v| self.apply_macros(v)).transpose()
    }

    pub(crate) fn attr_or(
        &self,
        node: &ScriptNode,
        name: &str,
        default: &str,
    ) -> IslResult<String> {
        Ok(self.attr(node, name)?.unwrap_or_else(|| default.to_string()))
    }

    pub(crate) fn attr_bool(
        &self,
        node: &ScriptNode,
        name: &str,
        default: bool,
    ) -> IslResult<bool> {
        match self.attr(node, name)? {
            Some(v) => Ok(v == "true" || v == "1"),
            None => Ok(default),
        }
    }

    pub(crate) fn attr_usize(
        &self,
        node: &ScriptNode,
        name: &str,
        default: usize,
    ) -> IslResult<usize> {
        match self.attr(node, name)? {
            Some(v) => v.trim().parse().map_err(|_| IslError::MacroType {
                attr: name.to_string(),
                expected: "integer",
                value: v,
            }),
            None => Ok(default),
        }
    }

    pub(crate) fn attr_f64(&self, node: &ScriptNode, name: &str, default: f64) -> IslResult<f64> {
        self.attr_rel_f64(node, name, 1.0, default)
    }

    /// Floating attribute, percent-relative against `base`.
    pub(crate) fn attr_rel_f64(
        &self,
        node: &ScriptNode,
        name: &str,
        base: f64,
        default: f64,
    ) -> IslResult<f64> {
        match self.attr(node, name)? {
            Some(v) => macros::parse_relative_f64(&v, base).ok_or(IslError::MacroType {
                attr: name.to_string(),
                expected: "number",
                value: v,
            }),
            None => Ok(default),
        }
    }

    pub(crate) fn attr_color(
        &self,
        node: &ScriptNode,
        name: &str,
        default: image::Rgba<u8>,
    ) -> IslResult<image::Rgba<u8>> {
        match self.attr(node, name)? {
            Some(v) => macros::parse_color(&v).ok_or(IslError::MacroType {
                attr: name.to_string(),
                expected: "color",
                value: v,
            }),
            None => Ok(default),
        }
    }

    pub(crate) fn evaluator(&self) -> IslResult<&dyn ScriptEvaluator> {
        self.interp
            .evaluator
            .as_deref()
            .ok_or_else(|| IslError::evaluation("no script evaluator configured"))
    }

    // ---- the walk -------------------------------------------------------

    pub(crate) fn process_node(&mut self, node: &ScriptNode) -> Step {
        if self.debug {
            tracing::debug!(tag = %node.tag, "processing");
        }
        let result = match handlers().get(node.tag.as_str()) {
            Some(handler) => handler(self, node),
            None => match self.procs.get(&node.tag).cloned() {
                Some(proc_node) => self.call_procedure(node, &proc_node),
                None => Err(IslError::unknown_tag(node.tag.clone()).into()),
            },
        };
        match result {
            Err(Unwind::Error(e)) => Err(Unwind::Error(e.at_node(node))),
            other => other,
        }
    }

    /// Run the children in order, honoring the parent's `onerror`.
    pub(crate) fn process_children(&mut self, node: &ScriptNode) -> Step {
        for child in &node.children {
            match self.process_node(child) {
                Ok(Flow::Proceed) => {}
                Ok(Flow::Stop) => return Ok(Flow::Stop),
                Err(Unwind::Error(e)) => {
                    let onerror = self.attr(node, "onerror").map_err(Unwind::Error)?;
                    if onerror.as_deref() == Some("ignore") && !e.is_invariant_violation() {
                        tracing::warn!(error = %e, "error ignored by onerror");
                        continue;
                    }
                    return Err(Unwind::Error(e));
                }
                Err(unwind) => return Err(unwind),
            }
        }
        Ok(Flow::Proceed)
    }

    fn call_procedure(&mut self, call_node: &ScriptNode, proc_node: &ScriptNode) -> Step {
        self.props.push();
        let result = self.run_procedure(call_node, proc_node);
        self.props.pop().map_err(IslError::into_unwind_err)?;
        match result {
            // A <return/> inside the body is normal completion.
            Err(Unwind::Return) => Ok(Flow::Proceed),
            other => other,
        }
    }

    fn run_procedure(&mut self, call_node: &ScriptNode, proc_node: &ScriptNode) -> Step {
        if let Some(paramtext) = call_node.child_text() {
            let paramtext = self.apply_macros(paramtext).map_err(Unwind::Error)?;
            self.props.put("paramtext", paramtext, false);
        }
        // Procedure defaults first, call-site attributes override.
        for source in [proc_node, call_node] {
            for (k, v) in &source.attrs {
                if k == "name" {
                    continue;
                }
                let v = self.apply_macros(v).map_err(Unwind::Error)?;
                self.props.put(k.clone(), v, false);
            }
        }
        match self.process_children(call_node)? {
            Flow::Stop => return Ok(Flow::Stop),
            Flow::Proceed => {}
        }
        self.process_children(proc_node)
    }

    // ---- output accumulation --------------------------------------------

    fn append_output_item(&mut self, node: &ScriptNode) -> IslResult<()> {
        let mut outputs = std::mem::take(&mut self.outputs);
        let result = (|| -> IslResult<()> {
            for context in &mut outputs {
                let key = self.attr_or(node, "template", "contents")?;
                if !context.buffers.contains_key(&key) {
                    let mut template = context
                        .node
                        .attr(&format!("template:{key}"))
                        .unwrap_or("${text}")
                        .to_string();
                    if let Some(path) = template.strip_prefix("file:") {
                        let path = self.apply_macros(path)?;
                        template = std::fs::read_to_string(path)?;
                    }
                    context.buffers.insert(key.clone(), String::new());
                    context.item_templates.insert(key.clone(), template);
                }

                let text = match self.attr(node, "text")? {
                    Some(text) => text,
                    None => {
                        if let Some(fromfile) = self.attr(node, "fromfile")? {
                            self.apply_macros(&std::fs::read_to_string(fromfile)?)?
                        } else if let Some(child) = node.child_text() {
                            self.apply_macros(child)?
                        } else {
                            // Fall back to the item template, fed with
                            // the write node's own attributes.
                            let mut attrs = PropertyTable::new();
                            for (k, v) in &node.attrs {
                                if k != "template" {
                                    attrs.insert(k.clone(), self.apply_macros(v)?);
                                }
                            }
                            let template = &context.item_templates[&key];
                            self.apply_macros_with(template, Some(&attrs))?
                        }
                    }
                };
                context
                    .buffers
                    .get_mut(&key)
                    .map(|buffer| buffer.push_str(&text));
            }
            Ok(())
        })();
        self.outputs = outputs;
        result
    }

    fn write_output(&self, context: &OutputContext) -> IslResult<()> {
        let file = self.attr(&context.node, "file")?.ok_or_else(|| {
            IslError::evaluation("output context is missing its file attribute")
        })?;
        let mut template = context
            .node
            .attr("template")
            .unwrap_or("${contents}")
            .to_string();
        if let Some(path) = template.strip_prefix("file:") {
            let path = self.apply_macros(path)?;
            template = std::fs::read_to_string(path)?;
        }
        let mut buffers = PropertyTable::new();
        for (key, buffer) in &context.buffers {
            buffers.insert(key.clone(), buffer.clone());
        }
        // An output with no writes still gets its default buffer, but a
        // property named "contents" beats the empty default.
        if !buffers.contains_key("contents") && self.props.get("contents").is_none() {
            buffers.insert("contents".to_string(), String::new());
        }
        let rendered = self.apply_macros_with(&template, Some(&buffers))?;
        std::fs::write(&file, rendered)?;
        tracing::debug!(file, "wrote output");
        Ok(())
    }
}

impl IslError {
    fn into_unwind_err(self) -> Unwind {
        Unwind::Error(self)
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---- tag handlers -------------------------------------------------------

type TagHandler = for<'i> fn(&mut Session<'i>, &ScriptNode) -> Step;

fn handlers() -> &'static BTreeMap<&'static str, TagHandler> {
    static TABLE: OnceLock<BTreeMap<&'static str, TagHandler>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: BTreeMap<&'static str, TagHandler> = BTreeMap::new();
        table.insert("isl", tag_isl);
        table.insert("group", tag_group);
        table.insert("foreach", tag_foreach);
        table.insert("if", tag_if);
        table.insert("procedure", tag_procedure);
        table.insert("call", tag_call);
        table.insert("break", |_, _| Err(Unwind::Break));
        table.insert("continue", |_, _| Err(Unwind::Continue));
        table.insert("return", |_, _| Err(Unwind::Return));
        table.insert("stop", |_, _| Ok(Flow::Stop));
        table.insert("output", tag_output);
        table.insert("property", tag_property);
        table.insert("increment", tag_increment);
        table.insert("replace", tag_replace);
        table.insert("append", tag_append);
        table.insert("clear", tag_clear);
        table.insert("echo", tag_echo);
        table.insert("import", tag_import);
        table.insert("fileset", tag_fileset);
        table.insert("exists", tag_exists);
        table.insert("mkdir", tag_mkdir);
        table.insert("move", tag_move);
        table.insert("rename", tag_move);
        table.insert("copy", tag_copy);
        table.insert("delete", tag_delete);
        table.insert("exec", tag_exec);
        table.insert("pause", tag_pause);
        table.insert("sleep", tag_pause);
        table.insert("eval", tag_eval);
        table.insert("ask", tag_ask);
        table.insert("asktocontinue", tag_ask_to_continue);
        table.insert("datasource", tag_datasource);
        table.insert("setfiles", tag_setfiles);
        table.insert("ftp", tag_ftp);
        table.insert("image", crate::capture::tag_image);
        table.insert("movie", crate::capture::tag_movie);
        table
    })
}

fn tag_isl(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    s.debug = s.attr_bool(node, "debug", s.debug)?;
    let offscreen = s.attr_bool(node, "offscreen", true)?;
    s.props
        .put("offscreen", if offscreen { "1" } else { "0" }, true);
    // The root tag is a group: loop, sleep and break/continue apply.
    tag_group(s, node)
}

fn tag_group(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let count = s.attr_usize(node, "loop", 1)?;
    let sleep = match s.attr(node, "sleep")? {
        Some(v) => Some(parse_duration(&v)?),
        None => None,
    };

    let saved_index = s.loop_index;
    s.props.push();
    let result = (|| -> Step {
        for i in 0..count {
            s.loop_index = i;
            let mut top = PropertyTable::new();
            macros::put_index(&mut top, "loopindex", i);
            for (k, v) in top {
                s.props.put(k, v, false);
            }
            match s.process_children(node) {
                Ok(Flow::Proceed) => {}
                Ok(Flow::Stop) => return Ok(Flow::Stop),
                Err(Unwind::Break) => break,
                Err(Unwind::Continue) => {}
                Err(other) => return Err(other),
            }
            if let Some(duration) = sleep
                && i + 1 < count
            {
                std::thread::sleep(duration);
            }
        }
        Ok(Flow::Proceed)
    })();
    s.props.pop().map_err(IslError::into_unwind_err)?;
    s.loop_index = saved_index;
    result
}

fn tag_foreach(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let mut bindings: Vec<(String, Vec<String>)> = Vec::new();
    for (k, v) in &node.attrs {
        if k == "onerror" {
            continue;
        }
        let expanded = s.apply_macros(v).map_err(Unwind::Error)?;
        let values = expanded.split(',').map(|t| t.trim().to_string()).collect();
        bindings.push((k.clone(), values));
    }
    let Some(rounds) = bindings.first().map(|(_, v)| v.len()) else {
        return Ok(Flow::Proceed);
    };
    if bindings.iter().any(|(_, v)| v.len() != rounds) {
        return Err(IslError::ForeachArity(node.describe()).into());
    }

    for round in 0..rounds {
        s.props.push();
        for (k, values) in &bindings {
            s.props.put(k.clone(), values[round].clone(), false);
        }
        let step = s.process_children(node);
        s.props.pop().map_err(IslError::into_unwind_err)?;
        match step {
            Ok(Flow::Proceed) => {}
            Ok(Flow::Stop) => return Ok(Flow::Stop),
            Err(Unwind::Break) => break,
            Err(Unwind::Continue) => {}
            Err(other) => return Err(other),
        }
    }
    Ok(Flow::Proceed)
}

fn tag_if(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let expr = match s.attr(node, "expr")? {
        Some(expr) => expr,
        None => match node.child_text() {
            Some(text) => s.apply_macros(text).map_err(Unwind::Error)?,
            None => return Err(IslError::evaluation("if tag has no expression").into()),
        },
    };
    let result = s.evaluator().map_err(Unwind::Error)?.eval(&expr)?;
    let truthy = result.trim() == "1";

    let then_node = node.find_child("then");
    let else_node = node.find_child("else");
    let branch = if truthy { then_node } else { else_node };
    match branch {
        Some(branch) => s.process_children(branch),
        // Bare-if form: direct children run on true.
        None if truthy && then_node.is_none() && else_node.is_none() => s.process_children(node),
        None => Ok(Flow::Proceed),
    }
}

fn tag_procedure(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = node
        .attr("name")
        .ok_or_else(|| IslError::evaluation("procedure tag requires a name"))?;
    s.procs.insert(name.to_string(), node.clone());
    Ok(Flow::Proceed)
}

fn tag_call(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = s
        .attr(node, "name")?
        .ok_or_else(|| IslError::evaluation("call tag requires a name"))?;
    let proc_node = s
        .procs
        .get(&name)
        .cloned()
        .ok_or_else(|| IslError::evaluation(format!("no procedure named '{name}'")))?;
    s.call_procedure(node, &proc_node)
}

fn tag_output(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    if !node.has_attr("file") {
        s.append_output_item(node)?;
        return Ok(Flow::Proceed);
    }
    s.outputs.push(OutputContext::new(node.clone()));
    s.props.push();
    let step = s.process_children(node);
    let context = s
        .outputs
        .pop()
        .ok_or_else(|| IslError::evaluation("output context vanished"))?;
    // Render the close template before the scope pops: properties set
    // inside the block can feed its tokens.
    let step = match step {
        Ok(Flow::Proceed) => s
            .write_output(&context)
            .map(|()| Flow::Proceed)
            .map_err(IslError::into_unwind_err),
        other => other,
    };
    s.props.pop().map_err(IslError::into_unwind_err)?;
    step
}

fn tag_property(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = s
        .attr(node, "name")?
        .ok_or_else(|| IslError::evaluation("property tag requires a name"))?;
    let value = if let Some(value) = s.attr(node, "value")? {
        value
    } else if let Some(fromfile) = s.attr(node, "fromfile")? {
        s.apply_macros(std::fs::read_to_string(fromfile)?.trim_end())
            .map_err(Unwind::Error)?
    } else if let Some(text) = node.child_text() {
        s.apply_macros(text).map_err(Unwind::Error)?
    } else {
        String::new()
    };
    let global = s.attr_bool(node, "global", false)?;
    s.props.put(name, value, global);
    Ok(Flow::Proceed)
}

fn tag_increment(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = s
        .attr(node, "name")?
        .ok_or_else(|| IslError::evaluation("increment tag requires a name"))?;
    let by = s.attr_f64(node, "value", 1.0)?;
    let current: f64 = s
        .props
        .get(&name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.0);
    let next = current + by;
    let rendered = if next.fract() == 0.0 {
        format!("{}", next as i64)
    } else {
        next.to_string()
    };
    s.props.find_owning_mut(&name).insert(name, rendered);
    Ok(Flow::Proceed)
}

fn tag_replace(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = s
        .attr(node, "name")?
        .ok_or_else(|| IslError::evaluation("replace tag requires a name"))?;
    let pattern = s.attr_or(node, "pattern", "")?;
    let with = s.attr_or(node, "with", "")?;
    if let Some(current) = s.props.get(&name).map(str::to_string) {
        let updated = current.replace(&pattern, &with);
        s.props.find_owning_mut(&name).insert(name, updated);
    }
    Ok(Flow::Proceed)
}

fn tag_append(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = s
        .attr(node, "name")?
        .ok_or_else(|| IslError::evaluation("append tag requires a name"))?;
    let value = s.attr_or(node, "value", "")?;
    let current = s.props.get(&name).unwrap_or_default().to_string();
    s.props
        .find_owning_mut(&name)
        .insert(name, format!("{current}{value}"));
    Ok(Flow::Proceed)
}

fn tag_clear(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let name = s
        .attr(node, "name")?
        .ok_or_else(|| IslError::evaluation("clear tag requires a name"))?;
    s.props.clear_global(&name);
    Ok(Flow::Proceed)
}

fn tag_echo(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let message = match s.attr(node, "message")? {
        Some(message) => message,
        None => match node.child_text() {
            Some(text) => s.apply_macros(text).map_err(Unwind::Error)?,
            None => String::new(),
        },
    };
    tracing::info!(target: "isl", "{message}");
    Ok(Flow::Proceed)
}

fn tag_import(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let file = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("import tag requires a file"))?;
    let xml = std::fs::read_to_string(&file)?;
    let imported = parse_script(&xml)?;
    tracing::debug!(file, "imported script");
    s.process_node(&imported)
}

fn tag_fileset(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    // The tag is itself a fileset; wrap it so the resolver sees it as a
    // child.
    let wrapper = ScriptNode::group(vec![node.clone()]);
    let mut expand = |raw: &str| s.apply_macros(raw);
    let files = fileset::find_files(&wrapper, &mut expand)?
        .unwrap_or_default();

    for file in files {
        s.props.push();
        publish_file_props(s, &file);
        let step = s.process_children(node);
        s.props.pop().map_err(IslError::into_unwind_err)?;
        match step {
            Ok(Flow::Proceed) => {}
            Ok(Flow::Stop) => return Ok(Flow::Stop),
            Err(Unwind::Break) => break,
            Err(Unwind::Continue) => {}
            Err(other) => return Err(other),
        }
    }
    Ok(Flow::Proceed)
}

fn publish_file_props(s: &mut Session<'_>, file: &Path) {
    let full = file.to_string_lossy().into_owned();
    let tail = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tail_stem = file
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = file
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let no_suffix = match full.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => full.clone(),
    };
    s.props.put("file", full, false);
    s.props.put("fileprefix", prefix, false);
    s.props.put("filenosuffix", no_suffix, false);
    s.props.put("filetail", tail, false);
    s.props.put("filetailnosuffix", tail_stem, false);
}

fn tag_exists(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let file = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("exists tag requires a file"))?;
    let property = s.attr_or(node, "property", "exists")?;
    let value = if Path::new(&file).exists() { "1" } else { "0" };
    s.props.put(property, value, false);
    Ok(Flow::Proceed)
}

fn tag_mkdir(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let file = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("mkdir tag requires a file"))?;
    std::fs::create_dir_all(file)?;
    Ok(Flow::Proceed)
}

fn tag_move(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let from = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("move tag requires a file"))?;
    let to = s
        .attr(node, "to")?
        .ok_or_else(|| IslError::evaluation("move tag requires a to"))?;
    std::fs::rename(from, to)?;
    Ok(Flow::Proceed)
}

fn tag_copy(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let from = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("copy tag requires a file"))?;
    let to = s
        .attr(node, "to")?
        .ok_or_else(|| IslError::evaluation("copy tag requires a to"))?;
    std::fs::copy(from, to)?;
    Ok(Flow::Proceed)
}

fn tag_delete(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let file = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("delete tag requires a file"))?;
    std::fs::remove_file(file)?;
    Ok(Flow::Proceed)
}

fn tag_exec(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let command = s
        .attr(node, "command")?
        .ok_or_else(|| IslError::evaluation("exec tag requires a command"))?;
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| IslError::evaluation("exec command is empty"))?;
    let status = std::process::Command::new(program).args(parts).status()?;
    if !status.success() {
        tracing::warn!(command, %status, "exec command failed");
    }
    Ok(Flow::Proceed)
}

fn tag_pause(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let mut seconds = s.attr_f64(node, "seconds", 0.0)?;
    seconds += s.attr_f64(node, "minutes", 0.0)? * 60.0;
    seconds += s.attr_f64(node, "hours", 0.0)? * 3600.0;
    if seconds > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    } else if let Some(views) = &s.interp.views {
        for view in views.views() {
            view.wait_until_idle();
        }
    }
    Ok(Flow::Proceed)
}

fn tag_eval(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let expr = match s.attr(node, "expr")? {
        Some(expr) => expr,
        None => match node.child_text() {
            Some(text) => s.apply_macros(text).map_err(Unwind::Error)?,
            None => return Err(IslError::evaluation("eval tag has no expression").into()),
        },
    };
    let result = s.evaluator().map_err(Unwind::Error)?.eval(&expr)?;
    if let Some(property) = s.attr(node, "property")? {
        s.props.put(property, result, false);
    }
    Ok(Flow::Proceed)
}

fn tag_ask(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let message = s.attr_or(node, "message", "")?;
    let property = s
        .attr(node, "property")?
        .ok_or_else(|| IslError::evaluation("ask tag requires a property"))?;
    let default = s.attr(node, "default")?;
    let answer = match &s.interp.prompter {
        Some(prompter) => prompter.ask(&message, default.as_deref()),
        None => default.clone(),
    };
    match answer {
        Some(answer) => {
            s.props.put(property, answer, false);
            Ok(Flow::Proceed)
        }
        None => Err(Unwind::Quit),
    }
}

fn tag_ask_to_continue(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let message = s.attr_or(node, "message", "Continue?")?;
    let proceed = match &s.interp.prompter {
        Some(prompter) => prompter.confirm(&message),
        None => true,
    };
    if proceed { Ok(Flow::Proceed) } else { Err(Unwind::Quit) }
}

fn tag_datasource(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let registry = s
        .interp
        .data_sources
        .as_ref()
        .ok_or_else(|| IslError::evaluation("no data source registry configured"))?
        .clone();
    let source = s
        .attr(node, "url")?
        .or(s.attr(node, "file")?)
        .ok_or_else(|| IslError::evaluation("datasource tag requires a url or file"))?;
    let kind = s.attr(node, "type")?;
    let registered = registry.load(&source, kind.as_deref())?;
    if let Some(id) = s.attr(node, "id")? {
        s.data_source_ids.insert(id, registered);
    }
    Ok(Flow::Proceed)
}

fn tag_setfiles(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let registry = s
        .interp
        .data_sources
        .as_ref()
        .ok_or_else(|| IslError::evaluation("no data source registry configured"))?
        .clone();
    let id = s
        .attr(node, "datasource")?
        .ok_or_else(|| IslError::evaluation("setfiles tag requires a datasource"))?;
    let registered = s.data_source_ids.get(&id).cloned().unwrap_or(id);
    let mut expand = |raw: &str| s.apply_macros(raw);
    let files = fileset::find_files(node, &mut expand)?.unwrap_or_default();
    let files: Vec<String> = files
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    registry.set_files(&registered, &files)?;
    Ok(Flow::Proceed)
}

fn tag_ftp(s: &mut Session<'_>, node: &ScriptNode) -> Step {
    let transfer = s
        .interp
        .file_transfer
        .as_ref()
        .ok_or_else(|| IslError::evaluation("no file transfer configured"))?
        .clone();
    let file = s
        .attr(node, "file")?
        .ok_or_else(|| IslError::evaluation("ftp tag requires a file"))?;
    let server = s
        .attr(node, "server")?
        .ok_or_else(|| IslError::evaluation("ftp tag requires a server"))?;
    let destination = s.attr_or(node, "destination", "")?;
    let user = s.attr_or(node, "user", "anonymous")?;
    let password = s.attr_or(node, "password", "")?;
    transfer.upload(Path::new(&file), &server, &destination, &user, &password)?;
    Ok(Flow::Proceed)
}

/// Parse a duration like `30`, `30s`, `5 minutes`, `2h`. Bare numbers
/// are seconds.
fn parse_duration(s: &str) -> IslResult<Duration> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.trim().parse().map_err(|_| IslError::MacroType {
        attr: "sleep".to_string(),
        expected: "duration",
        value: s.to_string(),
    })?;
    let multiplier = match unit.trim() {
        "" | "s" | "seconds" => 1.0,
        "m" | "minutes" => 60.0,
        "h" | "hours" => 3600.0,
        _ => {
            return Err(IslError::MacroType {
                attr: "sleep".to_string(),
                expected: "duration unit (s, m, h)",
                value: s.to_string(),
            });
        }
    };
    Ok(Duration::from_secs_f64(value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3 minutes").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5 days").is_err());
    }

    #[test]
    fn second_session_on_same_interpreter_is_rejected_while_active() {
        // The guard clears the flag even on parse errors.
        let interp = Interpreter::new();
        assert!(interp.process_script("<isl><bogus/></isl>").is_err());
        assert!(interp.process_script("<isl/>").is_ok());
    }

    #[test]
    fn unknown_tags_fail_with_their_name() {
        let interp = Interpreter::new();
        let err = interp.process_script("<isl><bogus/></isl>").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn stop_is_success() {
        let interp = Interpreter::new();
        interp
            .process_script("<isl><stop/><bogus/></isl>")
            .unwrap();
    }

    #[test]
    fn onerror_ignore_swallows_script_errors() {
        let interp = Interpreter::new();
        interp
            .process_script(r#"<isl onerror="ignore"><bogus/><echo message="ok"/></isl>"#)
            .unwrap();
    }
}
