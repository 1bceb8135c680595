use shared::domain::ConversationId;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub open_conversation: Option<ConversationId>,
    pub foreground: bool,
}

/// What the user is looking at right now.
pub struct ViewState {
    tx: watch::Sender<ViewSnapshot>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ViewSnapshot::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        *self.tx.borrow()
    }

    pub fn open(&self, conversation_id: ConversationId) {
        self.tx
            .send_modify(|view| view.open_conversation = Some(conversation_id));
    }

    pub fn close(&self) {
        self.tx.send_modify(|view| view.open_conversation = None);
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.tx.send_modify(|view| view.foreground = foreground);
    }

    /// Open and foregrounded.
    pub fn is_viewing(&self, conversation_id: ConversationId) -> bool {
        let view = self.snapshot();
        view.foreground && view.open_conversation == Some(conversation_id)
    }
}
