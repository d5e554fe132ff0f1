//! Acceptor -- durable summary appends.

use super::*;

// Acceptor summary persistence
impl Acceptor {
    /// Log idx the next summary record will land at.
    pub(super) fn next_log_idx(&self) -> Result<u64, VeelaError> {
        match &self.db {
            Some(db) => Ok(db.current_idx_range().1),
            None => Err(VeelaError::new(
                ErrorKind::Closed,
                format!("acceptor {} is closed", self.id),
            )),
        }
    }

    /// Appends `new_summary` as the latest log record, marking every record
    /// below `delete_before` deletable (0 keeps everything), and installs it
    /// as the in-memory state only once the append is durable. Returns the
    /// idx it was written at.
    ///
    /// An append failure leaves the in-memory state untouched but marks the
    /// acceptor failed: whether the record reached disk is unknown, so only
    /// a fresh `load()` can tell which state is authoritative.
    pub(super) async fn persist_summary(
        &mut self,
        new_summary: AcceptorStateSummary,
        delete_before: u64,
    ) -> Result<u64, VeelaError> {
        let summary_bytes = Bytes::from(new_summary.to_bytes()?);
        let size = summary_bytes.len();

        let Some(db) = self.db.as_mut() else {
            return Err(VeelaError::new(
                ErrorKind::Closed,
                format!("acceptor {} is closed", self.id),
            ));
        };
        let idx = db.current_idx_range().1;

        let res = db
            .append_and_sync_with_watermark(idx, vec![summary_bytes], delete_before)
            .await;
        if let Err(e) = res {
            pf_error!(self.me; "summary append at idx {} failed: {}", idx, e);
            let kind = if e.kind() == ErrorKind::Closed {
                ErrorKind::Closed
            } else {
                ErrorKind::Io
            };
            return Err(self.poison(VeelaError::new(
                kind,
                format!("acceptor {} failed on log append: {}", self.id, e),
            )));
        }

        pf_trace!(self.me; "persisted summary at idx {} ({} bytes)", idx, size);
        self.state_summary = new_summary;
        Ok(idx)
    }
}
