pub type IslResult<T> = Result<T, IslError>;

#[derive(thiserror::Error, Debug)]
pub enum IslError {
    #[error("script parse error: {0}")]
    Parse(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("undefined macro in: {0}")]
    UnresolvedMacro(String),

    #[error("attribute '{attr}' is not a valid {expected}: '{value}'")]
    MacroType {
        attr: String,
        expected: &'static str,
        value: String,
    },

    #[error("foreach lists have mismatched lengths: {0}")]
    ForeachArity(String),

    #[error("property stack underflow")]
    StackUnderflow,

    #[error("a script session is already active on this interpreter")]
    SessionActive,

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("error processing {node}: {source}")]
    Tag {
        node: String,
        #[source]
        source: Box<IslError>,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IslError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn unknown_tag(tag: impl Into<String>) -> Self {
        Self::UnknownTag(tag.into())
    }

    pub fn unresolved_macro(text: impl Into<String>) -> Self {
        Self::UnresolvedMacro(text.into())
    }

    /// Attach the offending node's one-line rendering, once.
    pub fn at_node(self, node: &crate::script::ScriptNode) -> Self {
        match self {
            already @ Self::Tag { .. } => already,
            other => Self::Tag {
                node: node.describe(),
                source: Box::new(other),
            },
        }
    }

    /// Errors that signal a broken interpreter invariant rather than a
    /// script mistake. These are never swallowed by `onerror="ignore"`.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            Self::StackUnderflow | Self::SessionActive => true,
            Self::Tag { source, .. } => source.is_invariant_violation(),
            _ => false,
        }
    }
}

/// Continue-or-stop signal returned by tag handlers on the happy path.
///
/// `Stop` is planned early termination (the `<stop>` tag): it unwinds the
/// whole walk and the session still reports success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Stop,
}

/// Non-local exits raised by tag handlers.
///
/// Break/Continue/Return/Quit are control flow, not failures; only
/// `Error` carries a true error. Enclosing constructs match on these
/// explicitly: loops catch `Break`/`Continue`, procedure calls catch
/// `Return`, the session top catches `Quit`.
#[derive(Debug)]
pub enum Unwind {
    Break,
    Continue,
    Return,
    Quit,
    Error(IslError),
}

impl From<IslError> for Unwind {
    fn from(err: IslError) -> Self {
        Unwind::Error(err)
    }
}

impl From<std::io::Error> for Unwind {
    fn from(err: std::io::Error) -> Self {
        Unwind::Error(IslError::Io(err))
    }
}

impl From<image::ImageError> for Unwind {
    fn from(err: image::ImageError) -> Self {
        Unwind::Error(IslError::Image(err))
    }
}

/// The result of walking one script node.
pub type Step = Result<Flow, Unwind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert!(
            IslError::unknown_tag("bogus")
                .to_string()
                .contains("unknown tag: bogus")
        );
        assert!(
            IslError::unresolved_macro("a ${b} c")
                .to_string()
                .contains("undefined macro")
        );
        assert!(
            IslError::MacroType {
                attr: "loop".into(),
                expected: "integer",
                value: "x".into(),
            }
            .to_string()
            .contains("'loop'")
        );
    }

    #[test]
    fn invariant_violations_are_marked() {
        assert!(IslError::StackUnderflow.is_invariant_violation());
        assert!(IslError::SessionActive.is_invariant_violation());
        assert!(!IslError::parse("x").is_invariant_violation());
    }

    #[test]
    fn errors_convert_into_unwind() {
        let unwind: Unwind = IslError::parse("bad").into();
        assert!(matches!(unwind, Unwind::Error(IslError::Parse(_))));
    }
}
