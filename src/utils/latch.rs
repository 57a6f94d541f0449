use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LatchError {
    #[error("completion latch already released")]
    AlreadyReleased,
}

/// Count-down barrier owned by one upload session.
///
/// Starts at 1 for the request body that is still being parsed; every file
/// entering the pipeline adds one, every finished file and the end of parsing
/// take one away. The latch releases exactly once, on the transition to zero.
#[derive(Debug)]
pub struct CompletionLatch {
    pending: usize,
    released: bool,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self {
            pending: 1,
            released: false,
        }
    }

    pub fn enter(&mut self) -> Result<(), LatchError> {
        if self.released {
            return Err(LatchError::AlreadyReleased);
        }
        self.pending += 1;
        Ok(())
    }

    /// Returns `true` for the one call that releases the latch.
    pub fn leave(&mut self) -> Result<bool, LatchError> {
        if self.released {
            return Err(LatchError::AlreadyReleased);
        }
        self.pending -= 1;
        if self.pending == 0 {
            self.released = true;
        }
        Ok(self.released)
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}
