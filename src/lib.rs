#![forbid(unsafe_code)]

//! An interpreter for the Image Script Language (ISL): XML scripts that
//! capture frames from host views and push them through a compositing
//! pipeline of clip, matte, overlay, colorbar and resize directives,
//! writing still images and movies.
//!
//! The interpreter is host-agnostic: everything that touches a live
//! application (views, displays, expression evaluation, movie encoding,
//! prompting) comes in through the traits in [`view`].

pub mod annotate;
mod capture;
pub mod error;
mod fileset;
mod interp;
pub mod macros;
mod pipeline;
pub mod props;
pub mod script;
pub mod view;

pub use error::{Flow, IslError, IslResult};
pub use interp::Interpreter;
pub use script::{ScriptNode, parse_script, parse_shorthand};
pub use view::{
    CaptureSignal, ColorScale, DataSourceRegistry, DisplayControl, DisplayRegistry, FileTransfer,
    GeoBounds, GeoPoint, MovieEncoder, Prompter, RenderableView, ScriptEvaluator, SequenceGrabber,
    StaticView, ViewRegistry,
};
