//! Messages exchanged between connectors and the federation reconciler.

use crate::connector::ServiceExportEvent;
use std::fmt;
use std::sync::Arc;

/// Topic a message is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A member observed an applied ServiceExport.
    ExportCreated,
    /// A member observed a deleted ServiceExport.
    ExportDeleted,
    /// Admission accepted an export.
    ExportAccepted,
    /// Admission rejected an export.
    ExportRejected,
}

impl MessageKind {
    /// Every kind.
    pub const ALL: [MessageKind; 4] = [
        MessageKind::ExportCreated,
        MessageKind::ExportDeleted,
        MessageKind::ExportAccepted,
        MessageKind::ExportRejected,
    ];

    /// Stable topic string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ExportCreated => "service.export.created",
            MessageKind::ExportDeleted => "service.export.deleted",
            MessageKind::ExportAccepted => "service.export.accepted",
            MessageKind::ExportRejected => "service.export.rejected",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bus message. Created, accepted and rejected messages carry `new_obj`;
/// deleted messages carry `old_obj`.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic.
    pub kind: MessageKind,
    /// Previous state.
    pub old_obj: Option<Arc<ServiceExportEvent>>,
    /// New state.
    pub new_obj: Option<Arc<ServiceExportEvent>>,
}

impl Message {
    /// An export was applied in its origin member.
    pub fn export_created(event: Arc<ServiceExportEvent>) -> Self {
        Self::with_new(MessageKind::ExportCreated, event)
    }

    /// An export was removed from its origin member.
    pub fn export_deleted(event: Arc<ServiceExportEvent>) -> Self {
        Self {
            kind: MessageKind::ExportDeleted,
            old_obj: Some(event),
            new_obj: None,
        }
    }

    /// Admission accepted the export.
    pub fn export_accepted(event: Arc<ServiceExportEvent>) -> Self {
        Self::with_new(MessageKind::ExportAccepted, event)
    }

    /// Admission rejected the export.
    pub fn export_rejected(event: Arc<ServiceExportEvent>) -> Self {
        Self::with_new(MessageKind::ExportRejected, event)
    }

    fn with_new(kind: MessageKind, event: Arc<ServiceExportEvent>) -> Self {
        Self {
            kind,
            old_obj: None,
            new_obj: Some(event),
        }
    }

    /// The event this message is about.
    pub fn event(&self) -> Option<&Arc<ServiceExportEvent>> {
        match self.kind {
            MessageKind::ExportDeleted => self.old_obj.as_ref(),
            _ => self.new_obj.as_ref(),
        }
    }
}
