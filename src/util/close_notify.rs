use tokio::sync::watch;

/// Owner side of a one-shot close signal. Background tasks hold a [CloseNotify] and terminate
///  when the signal fires, or when the [Closer] is dropped.
pub struct Closer {
    tx: watch::Sender<bool>,
}
impl Default for Closer {
    fn default() -> Self {
        Closer::new()
    }
}
impl Closer {
    pub fn new() -> Closer {
        let (tx, _) = watch::channel(false);
        Closer { tx }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn notify(&self) -> CloseNotify {
        CloseNotify {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct CloseNotify {
    rx: watch::Receiver<bool>,
}
impl CloseNotify {
    /// Completes once the signal fired. This is cancel safe, i.e. it can be used as a branch in
    ///  `select!` loops.
    pub async fn closed(&mut self) {
        // an error means the closer is gone, which counts as closed
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}
