use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;

use crate::resources::imports::{
    secret_string, ANNOTATION_CURRENT_RETRY, AUTO_IMPORT_RETRY_KEY, ROSA_RETRY_TIMES_KEY,
};
use crate::{Error, Result};

/// Attempt budget carried by a credential secret: how many attempts have
/// been consumed (persisted as an annotation, so restarts cannot extend the
/// wait) and how many are allowed in total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    pub current: u32,
    pub total: u32,
}

impl RetryBudget {
    pub fn from_secret(cluster: &str, secret: &Secret) -> Result<RetryBudget> {
        let current = match secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_CURRENT_RETRY))
        {
            None => 0,
            Some(v) => v.parse().map_err(|_| {
                Error::InvalidCredential(
                    cluster.to_string(),
                    format!("the annotation {ANNOTATION_CURRENT_RETRY} is not a number: {v}"),
                )
            })?,
        };

        // rosa secrets carry their budget under retry_times
        let total = match secret_string(secret, AUTO_IMPORT_RETRY_KEY)
            .or_else(|| secret_string(secret, ROSA_RETRY_TIMES_KEY))
        {
            None => 1,
            Some(v) => v.parse().map_err(|_| {
                Error::InvalidCredential(
                    cluster.to_string(),
                    format!("the attempt budget is not a number: {v}"),
                )
            })?,
        };

        Ok(RetryBudget { current, total })
    }

    pub fn exhausted(&self) -> bool {
        self.current >= self.total
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is allowed after the period
    Retry { next: u32, after: Duration },
    /// The flow is over, either by exhaustion or a non-retryable failure
    Terminal { next: u32 },
}

/// Account for one failed attempt. The counter is monotonic and an attempt
/// is consumed whether or not the failure was retryable.
pub fn retry_decision(budget: RetryBudget, retryable: bool, period: Duration) -> RetryDecision {
    let next = budget.current.saturating_add(1);
    if !retryable || next >= budget.total {
        RetryDecision::Terminal { next }
    } else {
        RetryDecision::Retry {
            next,
            after: period,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const PERIOD: Duration = Duration::from_secs(30);

    fn budget_secret(current: Option<&str>, total: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                annotations: current.map(|c| {
                    BTreeMap::from([(ANNOTATION_CURRENT_RETRY.to_string(), c.to_string())])
                }),
                ..Default::default()
            },
            data: total.map(|t| {
                BTreeMap::from([(
                    AUTO_IMPORT_RETRY_KEY.to_string(),
                    ByteString(t.as_bytes().to_vec()),
                )])
            }),
            ..Default::default()
        }
    }

    #[test]
    fn budget_defaults_to_one_attempt() {
        let budget = RetryBudget::from_secret("c1", &budget_secret(None, None)).unwrap();
        assert_eq!(budget, RetryBudget { current: 0, total: 1 });
    }

    #[test]
    fn rosa_budget_key_is_honoured() {
        let mut secret = budget_secret(None, None);
        secret.data = Some(BTreeMap::from([(
            ROSA_RETRY_TIMES_KEY.to_string(),
            ByteString(b"4".to_vec()),
        )]));
        let budget = RetryBudget::from_secret("c1", &secret).unwrap();
        assert_eq!(budget.total, 4);
    }

    #[test]
    fn non_numeric_budget_is_rejected() {
        assert!(matches!(
            RetryBudget::from_secret("c1", &budget_secret(None, Some("lots"))),
            Err(Error::InvalidCredential(_, _))
        ));
        assert!(matches!(
            RetryBudget::from_secret("c1", &budget_secret(Some("x"), Some("3"))),
            Err(Error::InvalidCredential(_, _))
        ));
    }

    // A budget of three allows exactly three attempts, no matter how the
    // failures interleave with controller restarts.
    #[test]
    fn budget_of_three_allows_exactly_three_attempts() {
        let mut budget = RetryBudget { current: 0, total: 3 };

        for expected_next in [1, 2] {
            match retry_decision(budget, true, PERIOD) {
                RetryDecision::Retry { next, after } => {
                    assert_eq!(next, expected_next);
                    assert_eq!(after, PERIOD);
                    budget.current = next;
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        assert_eq!(
            retry_decision(budget, true, PERIOD),
            RetryDecision::Terminal { next: 3 }
        );
    }

    #[test]
    fn non_retryable_failure_is_terminal_with_budget_left() {
        let budget = RetryBudget { current: 0, total: 5 };
        assert_eq!(
            retry_decision(budget, false, PERIOD),
            RetryDecision::Terminal { next: 1 }
        );
    }

    #[test]
    fn default_budget_never_retries() {
        let budget = RetryBudget { current: 0, total: 1 };
        assert_eq!(
            retry_decision(budget, true, PERIOD),
            RetryDecision::Terminal { next: 1 }
        );
    }
}
