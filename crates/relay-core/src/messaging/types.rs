/// Outgoing "chat action" (typing indicator, etc).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
    UploadPhoto,
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_html: bool,
    pub supports_photos: bool,
    pub supports_documents: bool,
    pub max_message_len: usize,
}

impl Default for MessagingCapabilities {
    fn default() -> Self {
        Self {
            supports_html: true,
            supports_photos: true,
            supports_documents: true,
            max_message_len: 4096,
        }
    }
}
