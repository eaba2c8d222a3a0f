//! # Blockchain Reconciler
//!
//! Blocking poll-until-change primitive. After a write transaction, the
//! caller polls a getter until its answer differs from the value it had
//! before the write.
//!
//! ## Timeout contract
//!
//! [`verify_change`] sleeps [`WRITE_POLL_INTERVAL`] before every check and
//! gives up after [`WRITE_POLL_TIMEOUT_S`] seconds. Giving up is NOT an
//! error: it returns `Ok(PollOutcome::TimedOut)`. A caller that only uses
//! `?` proceeds as if the change landed. Registration and contract
//! evaluation rely on this because the established-contract loop
//! re-reads chain state on its own cadence. Any new caller that needs the
//! write to have landed must match on the outcome.
//!
//! ## Errors
//!
//! A failed getter call ends the poll immediately. A getter answering the
//! wrong [`ContractValue`] shape is [`ContractError::UnexpectedType`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::contract::{ContractClient, ContractResult, ContractValue};

/// Upper bound on waiting for a write to show up in a getter.
pub const WRITE_POLL_TIMEOUT_S: u64 = 480;

pub const WRITE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Changed,
    /// The budget ran out without a change. See the module docs.
    TimedOut,
}

impl PollOutcome {
    pub fn changed(self) -> bool {
        self == PollOutcome::Changed
    }
}

/// Decides whether a getter's answer moved away from `old`.
#[async_trait]
pub trait ChangePredicate: Send + Sync {
    async fn changed(
        &self,
        contract: &dyn ContractClient,
        params: &[ContractValue],
        old: &ContractValue,
    ) -> ContractResult<bool>;
}

/// `get_description` returned a list whose length differs from `old`.
pub struct DescriptionChanged;

#[async_trait]
impl ChangePredicate for DescriptionChanged {
    async fn changed(
        &self,
        contract: &dyn ContractClient,
        params: &[ContractValue],
        old: &ContractValue,
    ) -> ContractResult<bool> {
        let old_len = old.clone().expect_list("get_description baseline")?.len();
        let now = contract
            .invoke_method("get_description", params.to_vec())
            .await?
            .expect_list("get_description")?;
        trace!(
            "get_description returns {:?} at stable block {}",
            now,
            contract.stable_block()
        );
        Ok(now.len() != old_len)
    }
}

/// A string getter no longer equals `old`.
pub struct GetterChanged(pub &'static str);

/// `get_agreement_id` moved off the agreement that was current before the write.
pub const AGREEMENT_ID_CHANGED: GetterChanged = GetterChanged("get_agreement_id");

#[async_trait]
impl ChangePredicate for GetterChanged {
    async fn changed(
        &self,
        contract: &dyn ContractClient,
        params: &[ContractValue],
        old: &ContractValue,
    ) -> ContractResult<bool> {
        let now = contract.invoke_method(self.0, params.to_vec()).await?;
        if std::mem::discriminant(&now) != std::mem::discriminant(old) {
            return Err(crate::contract::ContractError::UnexpectedType {
                method: self.0.to_string(),
                expected: old.kind(),
                got: now.kind(),
            });
        }
        trace!("{} returns {} at stable block {}", self.0, now, contract.stable_block());
        Ok(&now != old)
    }
}

/// Poll `predicate` every five seconds until it reports a change, it
/// errors, or [`WRITE_POLL_TIMEOUT_S`] elapses.
///
/// Timing out returns `Ok(PollOutcome::TimedOut)`, not an error.
pub async fn verify_change<P>(
    predicate: &P,
    contract: &dyn ContractClient,
    params: &[ContractValue],
    old: &ContractValue,
) -> ContractResult<PollOutcome>
where
    P: ChangePredicate + ?Sized,
{
    let start = Instant::now();
    let budget = Duration::from_secs(WRITE_POLL_TIMEOUT_S);
    loop {
        tokio::time::sleep(WRITE_POLL_INTERVAL).await;
        let elapsed = start.elapsed();
        debug!(
            "polled {}s for state change on {}",
            elapsed.as_secs(),
            contract.contract_address()
        );
        if elapsed >= budget {
            error!(
                "timeout verifying blockchain state change for {}",
                contract.contract_address()
            );
            return Ok(PollOutcome::TimedOut);
        }
        if predicate.changed(contract, params, old).await? {
            debug!("state change observed on {}", contract.contract_address());
            return Ok(PollOutcome::Changed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractError;
    use crate::mock_contract::MockContract;

    struct Never;

    #[async_trait]
    impl ChangePredicate for Never {
        async fn changed(&self, _: &dyn ContractClient, _: &[ContractValue], _: &ContractValue) -> ContractResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_getter_times_out_softly() {
        let c = MockContract::new("0xdev");
        let start = Instant::now();
        let outcome = verify_change(&Never, &c, &[], &ContractValue::Unit).await.unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
        let waited = start.elapsed().as_secs();
        assert!((WRITE_POLL_TIMEOUT_S..WRITE_POLL_TIMEOUT_S + 10).contains(&waited));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_observed_after_a_few_polls() {
        let c = MockContract::new("0xdev");
        c.script(
            "get_agreement_id",
            vec![ContractValue::str("ag1"), ContractValue::str("ag1"), ContractValue::str("")],
        );
        let start = Instant::now();
        let outcome = verify_change(&AGREEMENT_ID_CHANGED, &c, &[], &ContractValue::str("ag1"))
            .await
            .unwrap();
        assert!(outcome.changed());
        assert_eq!(start.elapsed().as_secs(), 15);
        assert_eq!(c.call_count("get_agreement_id"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_getter_error_propagates_immediately() {
        let c = MockContract::new("0xdev");
        c.fail("get_description", "rpc down");
        let res = verify_change(
            &DescriptionChanged,
            &c,
            &[ContractValue::str("0xdev")],
            &ContractValue::StrList(vec![]),
        )
        .await;
        assert!(matches!(res, Err(ContractError::Invoke { .. })));
        assert_eq!(c.call_count("get_description"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_shape_is_an_error() {
        let c = MockContract::new("0xdev");
        c.set_value("get_agreement_id", ContractValue::Bool(false));
        let res = verify_change(&AGREEMENT_ID_CHANGED, &c, &[], &ContractValue::str("ag1")).await;
        assert!(matches!(res, Err(ContractError::UnexpectedType { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_description_growth_counts_as_change() {
        let c = MockContract::new("0xreg");
        c.script(
            "get_description",
            vec![
                ContractValue::StrList(vec![]),
                ContractValue::StrList(vec!["name".into(), "rpi".into()]),
            ],
        );
        let outcome = verify_change(
            &DescriptionChanged,
            &c,
            &[ContractValue::str("0xdev")],
            &ContractValue::StrList(vec![]),
        )
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Changed);
    }
}
