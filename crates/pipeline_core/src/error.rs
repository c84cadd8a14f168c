use std::any::Any;
use std::fmt;

/// Boxed error used at component boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Several independent failures reported as one error.
///
/// Used wherever every member of a group is attempted even when some fail,
/// e.g. shutting down all components of a graph. Messages are joined with `"; "`.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<BoxError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a failure to the set.
    pub fn push<E: Into<BoxError>>(&mut self, error: E) {
        self.errors.push(error.into());
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoxError> {
        self.errors.iter()
    }

    /// Returns true if any member's message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.errors.iter().any(|e| e.to_string().contains(needle))
    }

    /// `Ok(())` when nothing failed, the joined error otherwise.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Extracts a printable message from a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
