use crate::session::{ChannelHost, ChannelListener};
use framehook_core::channel::Transport;
use framehook_core::protocol::ProtocolError;
use framehook_core::PipeListener;
use std::sync::Arc;

/// Named pipes `\\.\pipe\framehook-<pid>-c2a` and `-a2c`.
pub struct PipeChannels;

impl ChannelListener for PipeListener {
    fn accept(&self) -> Result<Arc<dyn Transport>, ProtocolError> {
        Ok(Arc::new(PipeListener::accept(self)?))
    }

    fn cancel(&self) {
        PipeListener::cancel(self)
    }
}

impl ChannelHost for PipeChannels {
    fn listen(&self, pid: u32) -> Result<Arc<dyn ChannelListener>, ProtocolError> {
        Ok(Arc::new(PipeListener::bind(pid)?))
    }
}
