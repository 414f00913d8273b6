use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::budget::RateBudgetController;
use crate::drivers::{ChatDriver, EmbeddingDriver, EmbeddingResponse};
use crate::error::DriftError;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, PricingTable, TokenUsage};

/// Completion-size guess used for pre-admission estimates when the caller
/// sets no explicit output cap.
const DEFAULT_COMPLETION_ESTIMATE: u32 = 500;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before retry number `retry` (0-based): base delay doubled per
    /// step. Jitter stretches by up to 25%, which keeps successive delays
    /// non-decreasing since the next step doubles.
    fn delay_for(&self, retry: u32) -> Duration {
        let doubled = self.base_delay.saturating_mul(1u32 << retry.min(16));
        if self.jitter {
            doubled.mul_f64(rand::thread_rng().gen_range(1.0..1.25))
        } else {
            doubled
        }
    }
}

/// The resilience layer around every outbound provider call: budget
/// admission, a per-dispatch timeout, and bounded retry with exponential
/// backoff for transient failures.
///
/// The permit taken at admission is always released with the actual cost of
/// the call (zero when it failed), so slots and ledger reconcile on every
/// path.
pub struct DispatchGate {
    budget: Arc<RateBudgetController>,
    pricing: PricingTable,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl DispatchGate {
    pub fn new(
        budget: Arc<RateBudgetController>,
        pricing: PricingTable,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            budget,
            pricing,
            retry,
            request_timeout,
        }
    }

    pub fn budget(&self) -> &Arc<RateBudgetController> {
        &self.budget
    }

    pub fn cost_of(&self, model: &str, usage: Option<&TokenUsage>) -> f64 {
        self.pricing.actual(model, usage)
    }

    pub async fn send(
        &self,
        driver: &dyn ChatDriver,
        history: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, DriftError> {
        let prompt_estimate = driver.estimate_tokens(history);
        let completion_estimate = options.max_tokens.unwrap_or(DEFAULT_COMPLETION_ESTIMATE);
        let estimate = self
            .pricing
            .estimate(&options.model, prompt_estimate, completion_estimate);

        let permit = self.budget.try_admit(estimate).await?;
        let result = self.with_retry(|| driver.chat(history, options)).await;
        let actual = match &result {
            Ok(response) => self.pricing.actual(&options.model, response.usage.as_ref()),
            Err(_) => 0.0,
        };
        self.budget.release(permit, actual);
        result
    }

    /// Embedding calls made by evaluators go through the same admission,
    /// timeout, and retry discipline as chat dispatches.
    pub async fn send_embedding(
        &self,
        driver: &dyn EmbeddingDriver,
        text: &str,
    ) -> Result<EmbeddingResponse, DriftError> {
        let estimate = self
            .pricing
            .estimate(driver.model(), (text.len() / 4) as u32, 0);

        let permit = self.budget.try_admit(estimate).await?;
        let result = self.with_retry(|| driver.embed(text)).await;
        let actual = match &result {
            Ok(response) => self.pricing.actual(driver.model(), response.usage.as_ref()),
            Err(_) => 0.0,
        };
        self.budget.release(permit, actual);
        result
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, DriftError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriftError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match timeout(self.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(DriftError::Timeout(self.request_timeout)),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let mut delay = self.retry.delay_for(attempt - 1);
                    if let DriftError::RateLimited {
                        retry_after: Some(after),
                    } = &err
                    {
                        delay = delay.max(*after);
                    }
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying dispatch");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;
    use crate::types::{ChatMessage, MessageRole};

    struct FlakyDriver {
        calls: AtomicUsize,
        failures: Mutex<Vec<DriftError>>,
    }

    impl FlakyDriver {
        fn new(failures: Vec<DriftError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: Mutex::new(failures),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatDriver for FlakyDriver {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            options: &ChatOptions,
        ) -> Result<ChatResponse, DriftError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.failures.lock().unwrap().pop();
            match next {
                Some(err) => Err(err),
                None => Ok(ChatResponse {
                    message: ChatMessage::new(MessageRole::Assistant, "ok"),
                    usage: None,
                    logprobs: None,
                    model: options.model.clone(),
                }),
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn gate(max_attempts: u32) -> DispatchGate {
        DispatchGate::new(
            Arc::new(RateBudgetController::new(4, 100.0)),
            PricingTable::new(),
            RetryPolicy::new(max_attempts, Duration::from_millis(5)).without_jitter(),
            Duration::from_secs(5),
        )
    }

    fn rate_limited() -> DriftError {
        DriftError::RateLimited { retry_after: None }
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let driver = FlakyDriver::new(vec![rate_limited(), rate_limited()]);
        let options = ChatOptions::new("test-model");
        let response = gate(3)
            .send(&driver, &[ChatMessage::user("hi")], &options)
            .await
            .expect("succeeds on third attempt");
        assert_eq!(response.text(), "ok");
        assert_eq!(driver.calls(), 3);
    }

    #[tokio::test]
    async fn makes_exactly_max_attempts_with_nondecreasing_delays() {
        let driver = FlakyDriver::new(vec![rate_limited(), rate_limited(), rate_limited(), rate_limited()]);
        let options = ChatOptions::new("test-model");
        let started = Instant::now();
        let err = gate(3)
            .send(&driver, &[ChatMessage::user("hi")], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::RateLimited { .. }));
        assert_eq!(driver.calls(), 3);
        // base 5ms + doubled 10ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn never_retries_invalid_requests() {
        let driver = FlakyDriver::new(vec![DriftError::InvalidRequest("bad body".to_string())]);
        let options = ChatOptions::new("test-model");
        let err = gate(3)
            .send(&driver, &[ChatMessage::user("hi")], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::InvalidRequest(_)));
        assert_eq!(driver.calls(), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_prevents_any_attempt() {
        let budget = Arc::new(RateBudgetController::new(4, 0.0));
        let gate = DispatchGate::new(
            budget,
            PricingTable::new().with_model("test-model", crate::types::ModelPricing::new(1.0, 1.0)),
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        let driver = FlakyDriver::new(vec![]);
        let options = ChatOptions::new("test-model");
        let err = gate
            .send(&driver, &[ChatMessage::user("hi")], &options)
            .await
            .unwrap_err();
        assert!(err.is_budget_exceeded());
        assert_eq!(driver.calls(), 0);
    }

    #[tokio::test]
    async fn timeouts_are_retried() {
        struct SlowDriver {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ChatDriver for SlowDriver {
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                options: &ChatOptions,
            ) -> Result<ChatResponse, DriftError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    sleep(Duration::from_secs(60)).await;
                }
                Ok(ChatResponse {
                    message: ChatMessage::new(MessageRole::Assistant, "late"),
                    usage: None,
                    logprobs: None,
                    model: options.model.clone(),
                })
            }

            fn name(&self) -> &'static str {
                "slow"
            }
        }

        let driver = SlowDriver {
            calls: AtomicUsize::new(0),
        };
        let gate = DispatchGate::new(
            Arc::new(RateBudgetController::new(4, 100.0)),
            PricingTable::new(),
            RetryPolicy::new(2, Duration::from_millis(1)).without_jitter(),
            Duration::from_millis(20),
        );
        let options = ChatOptions::new("test-model");
        let response = gate
            .send(&driver, &[ChatMessage::user("hi")], &options)
            .await
            .expect("second attempt returns fast");
        assert_eq!(response.text(), "late");
    }
}
