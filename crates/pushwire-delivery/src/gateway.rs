//! Connection boundary between app runners and push gateways.
//!
//! A [`Gateway`] sends a batch of notifications for one app and reports a
//! single outcome for the batch. Protocol-specific gateways plug in through a
//! [`GatewayFactory`], which builds one gateway per app from its credentials.

use std::{future::Future, pin::Pin, sync::Arc};

use pushwire_core::{App, Notification, Protocol};

use crate::{
    error::{DeliveryError, Result},
    http::{HttpGateway, HttpGatewayConfig},
};

/// Boxed future returned by gateway sends.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A connection to a push gateway.
pub trait Gateway: Send + Sync + 'static {
    /// Sends `batch` on behalf of `app`.
    ///
    /// `Ok(())` means the gateway accepted every notification in the batch.
    /// Errors describe the whole batch and decide between retry and failure.
    fn send<'a>(&'a self, app: &'a App, batch: &'a [Notification]) -> BoxFuture<'a, Result<()>>;
}

/// Builds gateways for apps.
pub trait GatewayFactory: Send + Sync + 'static {
    /// Creates the gateway an app's workers send through.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the app's protocol is not
    /// supported or its credentials are unusable.
    fn build(&self, app: &App) -> Result<Arc<dyn Gateway>>;
}

/// Factory for the protocols this build ships gateways for.
///
/// Only [`Protocol::Webhook`] is supported; apps on other protocols are
/// rejected with a configuration error and left undelivered.
#[derive(Debug, Clone, Default)]
pub struct DefaultGatewayFactory {
    http: HttpGatewayConfig,
}

impl DefaultGatewayFactory {
    /// Creates a factory using `http` for webhook gateways.
    pub fn new(http: HttpGatewayConfig) -> Self {
        Self { http }
    }
}

impl GatewayFactory for DefaultGatewayFactory {
    fn build(&self, app: &App) -> Result<Arc<dyn Gateway>> {
        match app.protocol {
            Protocol::Webhook => Ok(Arc::new(HttpGateway::from_app(app, &self.http)?)),
            protocol => Err(DeliveryError::configuration(format!(
                "no gateway available for protocol {protocol} (app {})",
                app.name
            ))),
        }
    }
}
