//! Dispute arbitration on top of the escrow engine
//!
//! A dispute freezes its escrow in DISPUTED until an admin resolves it with
//! RELEASE or REFUND. Resolution and the resulting escrow settlement commit
//! in one batch.

use crate::error::{CoreError, Result};
use crate::escrow::EscrowEngine;
use crate::models::{
    Dispute, DisputeId, EscrowId, EscrowStatus, EscrowTransaction, Resolution, ResolutionAction,
    UserId,
};
use crate::notify::Notifier;
use crate::store::{RecordKey, WriteBatch};

impl EscrowEngine {
    /// Open a dispute on a PENDING or FUNDED escrow
    ///
    /// Checked in order: one open dispute per escrow, initiator is a party,
    /// escrow status.
    pub async fn initiate_dispute(
        &self,
        escrow_id: EscrowId,
        initiator_id: UserId,
        reason: &str,
        evidence: Vec<String>,
    ) -> Result<Dispute> {
        self.ensure_enabled()?;
        if reason.trim().is_empty() {
            return Err(CoreError::InvalidInput("dispute reason is required".into()));
        }

        let _lock = self.lock(RecordKey::Escrow(escrow_id)).await?;
        let mut escrow = self.load_escrow(&escrow_id).await?;
        if self.store.open_dispute_for(&escrow_id).await?.is_some() {
            return Err(CoreError::DuplicateDispute(escrow_id.to_string()));
        }
        if !escrow.is_party(&initiator_id) {
            return Err(CoreError::Forbidden(format!(
                "{initiator_id} is not a party to escrow {escrow_id}"
            )));
        }

        let now = self.clock.now();
        let dispute = Dispute::open(escrow_id, initiator_id, reason.to_string(), evidence, now);
        escrow.mark_disputed(dispute.id, now)?;

        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone()).put_dispute(dispute.clone());
        self.store.commit(batch).await?;

        tracing::info!(
            escrow = %escrow_id,
            dispute = %dispute.id,
            initiator = %dispute.initiator_id,
            "dispute opened"
        );
        self.notifier
            .emit(Notifier::dispute_opened(&dispute, &escrow))
            .await;
        Ok(dispute)
    }

    /// Admin ruling: settle the disputed escrow and close the dispute
    ///
    /// A disputed escrow that was never funded can only be refunded; that
    /// refund is recorded without calling the processor since nothing is in
    /// custody.
    pub async fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        resolution: Resolution,
        admin_id: UserId,
    ) -> Result<(Dispute, EscrowTransaction)> {
        self.ensure_enabled()?;
        if !self.admins.is_admin(&admin_id).await {
            return Err(CoreError::Forbidden(format!(
                "{admin_id} may not resolve disputes"
            )));
        }

        let escrow_id = self.load_dispute(&dispute_id).await?.escrow_id;
        let _escrow_lock = self.lock(RecordKey::Escrow(escrow_id)).await?;
        let _dispute_lock = self.lock(RecordKey::Dispute(dispute_id)).await?;

        let mut dispute = self.load_dispute(&dispute_id).await?;
        if !dispute.is_open() {
            return Err(CoreError::AlreadyResolved(dispute_id.to_string()));
        }
        let mut escrow = self.load_escrow(&escrow_id).await?;
        escrow.require_status(&[EscrowStatus::Disputed], "resolve dispute on")?;

        let funded = escrow.funded_at.is_some();
        if resolution.action == ResolutionAction::Release && !funded {
            return Err(CoreError::InvalidState(format!(
                "escrow {escrow_id} was never funded and cannot be released"
            )));
        }
        let mut linked = self.lock_linked(&escrow).await?;

        let now = self.clock.now();
        let reason = format!("dispute resolution: {}", resolution.reason);
        let action = resolution.action;
        match action {
            ResolutionAction::Release => escrow.release(&reason, now)?,
            ResolutionAction::Refund => escrow.refund(&reason, now)?,
        }
        dispute.resolve(resolution, admin_id, now)?;

        let mut batch = WriteBatch::new();
        batch.put_escrow(escrow.clone()).put_dispute(dispute.clone());
        linked.stage(&escrow, &mut batch, now);

        // Nothing is in custody for an unfunded escrow
        let receipt = match (action, funded) {
            (ResolutionAction::Release, _) => Some(self.payout_payment(&escrow).await?),
            (ResolutionAction::Refund, true) => Some(self.refund_payment(&escrow).await?),
            (ResolutionAction::Refund, false) => None,
        };
        match &receipt {
            Some(receipt) => self.commit_after_payment(batch, &escrow, receipt).await?,
            None => self.store.commit(batch).await?,
        }

        tracing::info!(
            dispute = %dispute_id,
            escrow = %escrow_id,
            ?action,
            admin = ?dispute.resolved_by,
            "dispute resolved"
        );
        self.notifier
            .emit(Notifier::dispute_resolved(&dispute, &escrow))
            .await;
        Ok((dispute, escrow))
    }

    pub async fn get_dispute(&self, dispute_id: &DisputeId) -> Result<Dispute> {
        self.ensure_enabled()?;
        self.load_dispute(dispute_id).await
    }

    async fn load_dispute(&self, dispute_id: &DisputeId) -> Result<Dispute> {
        self.store
            .dispute(dispute_id)
            .await?
            .ok_or_else(|| CoreError::not_found("dispute", dispute_id))
    }
}
