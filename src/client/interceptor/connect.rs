//! The network-boundary stage: allocates the exchange for this attempt.

use async_trait::async_trait;

use super::{Chain, Interceptor};
use crate::error::Error;
use crate::response::Response;

/// Opens a connection (pooled or fresh) and binds a codec to the call.
/// Everything after this stage runs with a live exchange.
#[derive(Debug, Default)]
pub(crate) struct ConnectInterceptor {
    _priv: (),
}

#[async_trait]
impl Interceptor for ConnectInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response, Error> {
        let exchange = chain.call_inner().clone().init_exchange(chain).await?;
        chain.set_exchange(exchange);
        let request = chain.request().clone();
        chain.proceed(request).await
    }
}
