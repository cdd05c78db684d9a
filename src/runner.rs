use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientError, Completion, CompletionClient, GenerationParams, Message},
    collector::ResponseCollector,
    prompts::{self, PromptTemplate, Variant},
    record::ResponseRecord,
};

/// Status codes eligible for retry: rate limiting and server-side transients.
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

fn is_transient(error: &ClientError) -> bool {
    error
        .status()
        .is_some_and(|status| RETRYABLE_STATUS.contains(&status))
}

/// Bounded retry with exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): doubles each
    /// time from the base, clamped to the ceiling.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Orchestrates the cross-product of models × expanded prompt variants,
/// issuing one blocking request at a time and forwarding each success to the
/// collector. A permanently failing combination is logged and skipped; it
/// never aborts the run.
pub struct Runner {
    client: Arc<dyn CompletionClient>,
    models: Vec<String>,
    params: GenerationParams,
    run_id: String,
    retry: RetryPolicy,
}

impl Runner {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        models: Vec<String>,
        params: GenerationParams,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            models,
            params,
            run_id: run_id.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Expands every template and processes each (model, variant) pair exactly
    /// once, models as the outer loop.
    pub async fn run(
        &self,
        templates: &[PromptTemplate],
        collector: &mut ResponseCollector,
    ) -> Result<()> {
        let registry = prompts::registry();
        let mut work: Vec<(&PromptTemplate, Variant)> = Vec::new();
        for template in templates {
            for variant in template.expand(&registry)? {
                work.push((template, variant));
            }
        }

        let total = self.models.len() * work.len();
        info!(
            run_id = %self.run_id,
            models = self.models.len(),
            variants = work.len(),
            total,
            "Starting run"
        );

        let mut request = 0usize;
        for model in &self.models {
            for (template, variant) in &work {
                request += 1;
                info!(request, total, model = %model, prompt_id = %template.id, "Prompting");
                self.process(model, template, variant, collector).await?;
            }
        }

        info!(run_id = %self.run_id, total, "Run complete");
        Ok(())
    }

    /// Issues one request with retry and writes the record on success. Only
    /// collector failures propagate; request failures are logged and skipped.
    async fn process(
        &self,
        model: &str,
        template: &PromptTemplate,
        variant: &Variant,
        collector: &mut ResponseCollector,
    ) -> Result<()> {
        let messages = [
            Message::system(&variant.system_text),
            Message::user(&variant.user_text),
        ];
        let mut params = self.params;
        params.logprobs = template.logprobs;

        let completion = match self
            .call_with_retry(model, &messages, &params, &template.id)
            .await
        {
            Ok(completion) => completion,
            Err(error) => {
                error!(model = %model, prompt_id = %template.id, %error, "Request failed");
                return Ok(());
            }
        };
        if completion.model != model {
            debug!(
                requested = %model,
                echoed = %completion.model,
                "Service echoed a different model identifier"
            );
        }

        let record = ResponseRecord {
            run_id: self.run_id.clone(),
            model: model.to_string(),
            prompt_id: template.id.clone(),
            variables: variant.variables.clone(),
            prompt_text: variant.user_text.clone(),
            system_text: variant.system_text.clone(),
            output: completion.output,
            finish_reason: completion.finish_reason,
            usage: completion.usage,
            timestamp: Utc::now(),
        };
        collector.save(&record)
    }

    async fn call_with_retry(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
        prompt_id: &str,
    ) -> Result<Completion, ClientError> {
        let mut attempt = 1;
        loop {
            match self.client.complete(model, messages, params).await {
                Ok(completion) => return Ok(completion),
                Err(error) if is_transient(&error) && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        model = %model,
                        prompt_id = %prompt_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
