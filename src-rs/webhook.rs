use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    stripe_api::{
        StripeApi, StripeCheckoutSession, StripeEvent, StripePaymentIntent, StripePaymentMethod,
        StripeSetupIntent, StripeSubscription,
    },
    subscriptions::{
        opt_epoch_seconds_to_datetime, SubscriptionChanges, SubscriptionRecord, SubscriptionStore,
    },
};

/// Fallback billing period when a payment event carries no subscription id.
pub const DEFAULT_PERIOD_DAYS: i64 = 30;
pub const DEFAULT_PLAN: &str = "pro";

const USER_ID_METADATA_KEY: &str = "user_id";
const SUBSCRIPTION_ID_METADATA_KEY: &str = "subscriptionId";

/// Every inbound event kind this handler distinguishes. Unrecognized kinds
/// land in `Other` and are acknowledged without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionUpdated,
    SetupIntentCreated,
    SetupIntentSucceeded,
    PaymentMethodAttached,
    CheckoutSessionCompleted,
    PaymentIntentSucceeded,
    Other,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "setup_intent.created" => Self::SetupIntentCreated,
            "setup_intent.succeeded" => Self::SetupIntentSucceeded,
            "payment_method.attached" => Self::PaymentMethodAttached,
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("No user_id found")]
    UnknownUser,
    #[error("Missing required fields")]
    MissingPaymentFields,
    #[error("Subscription event missing billing period bounds")]
    MissingPeriodBounds,
    #[error("failed to decode {0} object")]
    MalformedObject(&'static str, #[source] serde_json::Error),
    #[error(transparent)]
    Processing(#[from] anyhow::Error),
}

impl WebhookError {
    /// Bad-input errors are the caller's fault and must not trigger
    /// provider-side redelivery.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::UnknownUser
                | Self::MissingPaymentFields
                | Self::MissingPeriodBounds
                | Self::MalformedObject(..)
        )
    }
}

/// Read access to the payment provider, needed when a payment event carries
/// a subscription id and the authoritative state must be fetched.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn subscription_details(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription>;
}

#[async_trait]
impl BillingProvider for StripeApi {
    async fn subscription_details(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.get_json(&format!("subscriptions/{}", subscription_id), &[])
            .await
    }
}

/// Applies one verified event to the subscription store. The caller has
/// already checked the signature; this function never re-reads the wire.
pub async fn process_event(
    event: StripeEvent,
    store: &dyn SubscriptionStore,
    billing: &dyn BillingProvider,
) -> Result<(), WebhookError> {
    match EventKind::from_type(&event.event_type) {
        EventKind::SubscriptionUpdated => {
            let subscription: StripeSubscription = decode("subscription", event.data.object)?;
            tracing::info!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                cancel_at = ?subscription.cancel_at,
                "processing subscription update"
            );
            apply_subscription_update(subscription, store).await
        }
        EventKind::SetupIntentCreated | EventKind::SetupIntentSucceeded => {
            let intent: StripeSetupIntent = decode("setup intent", event.data.object)?;
            tracing::info!(id = %intent.id, status = ?intent.status, "setup intent acknowledged");
            Ok(())
        }
        EventKind::PaymentMethodAttached => {
            let method: StripePaymentMethod = decode("payment method", event.data.object)?;
            tracing::info!(
                id = %method.id,
                method_type = ?method.method_type,
                customer = ?method.customer.as_ref().map(|customer| customer.id()),
                "payment method acknowledged"
            );
            Ok(())
        }
        EventKind::CheckoutSessionCompleted => {
            let session: StripeCheckoutSession = decode("checkout session", event.data.object)?;
            apply_payment(PaymentIdentity::from_session(session), store, billing).await
        }
        EventKind::PaymentIntentSucceeded => {
            let intent: StripePaymentIntent = decode("payment intent", event.data.object)?;
            apply_payment(PaymentIdentity::from_payment_intent(intent), store, billing).await
        }
        EventKind::Other => {
            tracing::info!(event_type = %event.event_type, "unhandled event type");
            Ok(())
        }
    }
}

fn decode<T: DeserializeOwned>(
    kind: &'static str,
    object: serde_json::Value,
) -> Result<T, WebhookError> {
    serde_json::from_value(object).map_err(|error| WebhookError::MalformedObject(kind, error))
}

/// Sources for the owning user id of a subscription-updated event, tried in
/// declaration order until one yields an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIdResolver {
    SubscriptionMetadata,
    StoreBySubscriptionId,
}

pub const USER_ID_RESOLVERS: [UserIdResolver; 2] = [
    UserIdResolver::SubscriptionMetadata,
    UserIdResolver::StoreBySubscriptionId,
];

impl UserIdResolver {
    pub async fn resolve(
        self,
        subscription: &StripeSubscription,
        store: &dyn SubscriptionStore,
    ) -> anyhow::Result<Option<String>> {
        match self {
            Self::SubscriptionMetadata => Ok(subscription
                .metadata
                .get(USER_ID_METADATA_KEY)
                .filter(|value| !value.trim().is_empty())
                .cloned()),
            Self::StoreBySubscriptionId => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    "no user_id in metadata, searching the store"
                );
                store.find_user_by_subscription_id(&subscription.id).await
            }
        }
    }
}

async fn resolve_user_id(
    subscription: &StripeSubscription,
    store: &dyn SubscriptionStore,
) -> anyhow::Result<Option<String>> {
    for resolver in USER_ID_RESOLVERS {
        if let Some(user_id) = resolver.resolve(subscription, store).await? {
            return Ok(Some(user_id));
        }
    }
    Ok(None)
}

async fn apply_subscription_update(
    subscription: StripeSubscription,
    store: &dyn SubscriptionStore,
) -> Result<(), WebhookError> {
    let user_id = resolve_user_id(&subscription, store)
        .await?
        .ok_or(WebhookError::UnknownUser)?;

    let current_period_start = opt_epoch_seconds_to_datetime(subscription.current_period_start)
        .ok_or(WebhookError::MissingPeriodBounds)?;
    let current_period_end = opt_epoch_seconds_to_datetime(subscription.current_period_end)
        .ok_or(WebhookError::MissingPeriodBounds)?;

    let changes = SubscriptionChanges {
        status: subscription.status.clone(),
        current_period_start,
        current_period_end,
        cancel_at: opt_epoch_seconds_to_datetime(subscription.cancel_at),
        canceled_at: opt_epoch_seconds_to_datetime(subscription.canceled_at),
    };

    store.update_subscription(&user_id, &changes).await?;
    tracing::info!(user_id = %user_id, status = %changes.status, "subscription updated");
    Ok(())
}

/// The identifying fields a payment event must carry, normalized across the
/// checkout-session and payment-intent shapes.
#[derive(Debug, Clone)]
struct PaymentIdentity {
    user_id: Option<String>,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    setup_mode: bool,
}

impl PaymentIdentity {
    fn from_session(session: StripeCheckoutSession) -> Self {
        let user_id = session
            .client_reference_id
            .filter(|value| !value.trim().is_empty())
            .or_else(|| session.metadata.get(USER_ID_METADATA_KEY).cloned());

        Self {
            user_id,
            customer_id: session.customer.as_ref().map(|value| value.id()),
            subscription_id: session.subscription.as_ref().map(|value| value.id()),
            setup_mode: session.mode.as_deref() == Some("setup"),
        }
    }

    fn from_payment_intent(intent: StripePaymentIntent) -> Self {
        Self {
            user_id: intent.metadata.get(USER_ID_METADATA_KEY).cloned(),
            customer_id: intent.customer.as_ref().map(|value| value.id()),
            subscription_id: intent.metadata.get(SUBSCRIPTION_ID_METADATA_KEY).cloned(),
            setup_mode: false,
        }
    }
}

async fn apply_payment(
    identity: PaymentIdentity,
    store: &dyn SubscriptionStore,
    billing: &dyn BillingProvider,
) -> Result<(), WebhookError> {
    if identity.setup_mode {
        tracing::info!("setup session completed, no subscription update needed");
        return Ok(());
    }

    let (user_id, customer_id) = match (identity.user_id, identity.customer_id) {
        (Some(user_id), Some(customer_id))
            if !user_id.trim().is_empty() && !customer_id.trim().is_empty() =>
        {
            (user_id, customer_id)
        }
        (user_id, customer_id) => {
            tracing::error!(
                user_id = ?user_id,
                customer_id = ?customer_id,
                subscription_id = ?identity.subscription_id,
                "payment event missing identifying fields"
            );
            return Err(WebhookError::MissingPaymentFields);
        }
    };

    let details = match &identity.subscription_id {
        Some(subscription_id) => {
            let subscription = billing.subscription_details(subscription_id).await?;
            tracing::info!(
                status = %subscription.status,
                current_period_end = ?subscription.current_period_end,
                "retrieved subscription details"
            );
            Some(subscription)
        }
        None => None,
    };

    let now = Utc::now();
    let record = SubscriptionRecord {
        user_id,
        status: details
            .as_ref()
            .map(|details| details.status.clone())
            .unwrap_or_else(|| "active".to_string()),
        plan: DEFAULT_PLAN.to_string(),
        current_period_start: details
            .as_ref()
            .and_then(|details| opt_epoch_seconds_to_datetime(details.current_period_start))
            .unwrap_or(now),
        current_period_end: details
            .as_ref()
            .and_then(|details| opt_epoch_seconds_to_datetime(details.current_period_end))
            .unwrap_or_else(|| now + chrono::Duration::days(DEFAULT_PERIOD_DAYS)),
        cancel_at: details
            .as_ref()
            .and_then(|details| opt_epoch_seconds_to_datetime(details.cancel_at)),
        canceled_at: details
            .as_ref()
            .and_then(|details| opt_epoch_seconds_to_datetime(details.canceled_at)),
        stripe_customer_id: customer_id,
        stripe_subscription_id: identity.subscription_id,
    };

    store.upsert_subscription(&record).await?;
    tracing::info!(user_id = %record.user_id, "subscription upserted");
    Ok(())
}
