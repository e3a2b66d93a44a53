use std::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub progress: u8,
    pub stage: Option<String>,
    pub at: Instant,
}
