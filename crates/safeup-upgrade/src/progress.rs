use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Staging,
    Hydrating,
    Snapshot,
    Swap,
    Finalize,
    Rollback,
    Complete,
}

impl ProgressStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Hydrating => "hydrating",
            Self::Snapshot => "snapshot",
            Self::Swap => "swap",
            Self::Finalize => "finalize",
            Self::Rollback => "rollback",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub message: String,
    pub percent: Option<u8>,
}

pub trait ProgressSink {
    fn report(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent),
{
    fn report(&mut self, event: &ProgressEvent) {
        self(event)
    }
}
