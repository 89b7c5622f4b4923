use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena `{label}` already has an outstanding reservation")]
    Outstanding { label: &'static str },
    #[error("arena `{label}` cannot fit {requested} bytes ({available} left in the region)")]
    RegionExhausted {
        label: &'static str,
        requested: u64,
        available: u64,
    },
    #[error("arena `{label}` was used before init")]
    Uninitialised { label: &'static str },
    #[error("reservation of {reserved} bytes cannot hold {used} bytes")]
    Overrun { reserved: u64, used: u64 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("failed to request device: {0}")]
    RequestDevice(String),
    #[error("draw issued without {0}")]
    IncompleteDraw(&'static str),
    #[error("pixel read-back failed: {0}")]
    Readback(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("{what}: requested {requested} exceeds the capacity of {capacity}")]
    CapacityExceeded {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("capture size changed from {expected} to {actual} bytes while the pack buffer is live")]
    CaptureSizeMismatch { expected: usize, actual: usize },
    #[error("capture buffer holds {provided} bytes, {required} required")]
    CaptureBufferTooSmall { required: usize, provided: usize },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RenderError {
    /// Fatal errors indicate a programming error in the caller (batch sizes
    /// or arena discipline). The remaining ones only abort the current call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::CapacityExceeded { .. } | RenderError::Arena(_)
        )
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_arena_errors_are_fatal() {
        let capacity = RenderError::CapacityExceeded {
            what: "multi-draw commands",
            requested: 9000,
            capacity: 8192,
        };
        assert!(capacity.is_fatal());
        assert!(RenderError::from(ArenaError::Outstanding { label: "storage" }).is_fatal());
        assert!(!RenderError::CaptureSizeMismatch {
            expected: 12,
            actual: 24
        }
        .is_fatal());
        assert!(!RenderError::from(DeviceError::NoAdapter).is_fatal());
    }

    #[test]
    fn messages_name_the_offending_values() {
        let err = RenderError::CapacityExceeded {
            what: "multi-draw commands",
            requested: 9000,
            capacity: 8192,
        };
        let text = err.to_string();
        assert!(text.contains("9000"));
        assert!(text.contains("8192"));
    }
}
