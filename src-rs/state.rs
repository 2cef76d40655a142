use std::{sync::Arc, time::Duration};

use crate::{
    config::Config, rate_limit::InMemoryRateLimiter, solution::OpenAiClient,
    stripe_api::StripeApi, supabase::SupabaseClient,
};

const GENERATE_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Explicitly constructed collaborators, owned by the hosting process and
/// shared by clone across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SupabaseClient,
    pub stripe: StripeApi,
    pub openai: OpenAiClient,
    pub generate_limiter: Arc<InMemoryRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: SupabaseClient,
        stripe: StripeApi,
        openai: OpenAiClient,
    ) -> Self {
        Self {
            generate_limiter: Arc::new(InMemoryRateLimiter::new(
                GENERATE_RATE_WINDOW,
                config.generate_rate_limit,
            )),
            config: Arc::new(config),
            db,
            stripe,
            openai,
        }
    }
}
