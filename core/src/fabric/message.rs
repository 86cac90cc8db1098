use std::sync::Arc;

use crate::domain::{ProgressMessage, StatusMessage};

#[derive(Debug, Clone)]
pub enum FabricMessage {
    Progress(ProgressMessage),
    Status(StatusMessage),
}

impl FabricMessage {
    pub fn analysis_id(&self) -> &str {
        match self {
            FabricMessage::Progress(p) => &p.analysis_id,
            FabricMessage::Status(s) => &s.analysis_id,
        }
    }
}

pub type SubscriberFn = Arc<dyn Fn(FabricMessage) + Send + Sync>;
