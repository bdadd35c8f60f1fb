use super::{methods, NOT_FOUND_CODE};
use anyhow::Context as _;
use isaac_network::{Channel as _, ChannelError, Handler, NodeInfo};
use isaac_roles::messages::{Block, BlockDataMap, Hash, Height, Manifest, Seal};
use jsonrpsee::{
    core::RpcResult,
    server::{middleware::http::ProxyGetRequestLayer, RpcModule, Server},
    types::{error::ErrorCode, ErrorObject, ErrorObjectOwned, Params},
};
use std::{net::SocketAddr, sync::Arc};
use zksync_concurrency::{ctx, time};

/// Upper bound on serving a single request.
const REQUEST_TIMEOUT: time::Duration = time::Duration::seconds(10);

struct State {
    /// Parent of the request contexts; canceled when serving stops.
    ctx: ctx::Ctx,
    handler: Arc<Handler>,
}

impl State {
    fn request_ctx(&self) -> ctx::Ctx {
        self.ctx.with_timeout(REQUEST_TIMEOUT)
    }
}

fn to_rpc_error(err: ChannelError) -> ErrorObjectOwned {
    match err {
        ChannelError::NotFound(what) => ErrorObject::owned(NOT_FOUND_CODE, what, None::<()>),
        err => {
            tracing::debug!("ISAAC rpc - request failed: {err:#}");
            ErrorObject::owned(
                ErrorCode::InternalError.code(),
                err.to_string(),
                None::<()>,
            )
        }
    }
}

async fn send_seal(params: Params<'static>, state: Arc<State>) -> RpcResult<()> {
    let seal: Seal = params.one()?;
    let ctx = &state.request_ctx();
    state
        .handler
        .send_seal(ctx, &seal)
        .await
        .map_err(to_rpc_error)
}

async fn seals(params: Params<'static>, state: Arc<State>) -> RpcResult<Vec<Seal>> {
    let hashes: Vec<Hash> = params.one()?;
    let ctx = &state.request_ctx();
    state
        .handler
        .seals(ctx, &hashes)
        .await
        .map_err(to_rpc_error)
}

async fn manifests(params: Params<'static>, state: Arc<State>) -> RpcResult<Vec<Manifest>> {
    let heights: Vec<Height> = params.one()?;
    let ctx = &state.request_ctx();
    state
        .handler
        .manifests(ctx, &heights)
        .await
        .map_err(to_rpc_error)
}

async fn blocks(params: Params<'static>, state: Arc<State>) -> RpcResult<Vec<Block>> {
    let heights: Vec<Height> = params.one()?;
    let ctx = &state.request_ctx();
    state
        .handler
        .blocks(ctx, &heights)
        .await
        .map_err(to_rpc_error)
}

async fn block_data_maps(
    params: Params<'static>,
    state: Arc<State>,
) -> RpcResult<Vec<BlockDataMap>> {
    let heights: Vec<Height> = params.one()?;
    let ctx = &state.request_ctx();
    state
        .handler
        .block_data_maps(ctx, &heights)
        .await
        .map_err(to_rpc_error)
}

/// Raw bytes travel hex encoded.
async fn block_data(params: Params<'static>, state: Arc<State>) -> RpcResult<String> {
    let url: String = params.one()?;
    let ctx = &state.request_ctx();
    let raw = state
        .handler
        .block_data(ctx, &url)
        .await
        .map_err(to_rpc_error)?;
    Ok(hex::encode(raw))
}

async fn node_info(state: Arc<State>) -> RpcResult<NodeInfo> {
    let ctx = &state.request_ctx();
    state.handler.node_info(ctx).await.map_err(to_rpc_error)
}

fn module(ctx: &ctx::Ctx, handler: Arc<Handler>) -> anyhow::Result<RpcModule<State>> {
    let mut module = RpcModule::new(State {
        ctx: ctx.with_deadline(time::Deadline::Infinite),
        handler,
    });
    module.register_method(methods::HEALTH_CHECK, |_, _, _| -> RpcResult<_> {
        Ok(serde_json::json!({"health": true}))
    })?;
    module.register_async_method(methods::SEND_SEAL, |params, state, _| {
        send_seal(params, state)
    })?;
    module.register_async_method(methods::SEALS, |params, state, _| seals(params, state))?;
    module.register_async_method(methods::MANIFESTS, |params, state, _| {
        manifests(params, state)
    })?;
    module.register_async_method(methods::BLOCKS, |params, state, _| blocks(params, state))?;
    module.register_async_method(methods::BLOCK_DATA_MAPS, |params, state, _| {
        block_data_maps(params, state)
    })?;
    module.register_async_method(methods::BLOCK_DATA, |params, state, _| {
        block_data(params, state)
    })?;
    module.register_async_method(methods::NODE_INFO, |_, state, _| node_info(state))?;
    Ok(module)
}

/// Serves `handler` on `addr` until `ctx` is canceled.
pub(super) async fn serve(
    ctx: &ctx::Ctx,
    addr: SocketAddr,
    handler: Arc<Handler>,
) -> anyhow::Result<()> {
    // Proxy `GET /health` requests to the `health_check` method.
    let service_builder = tower::ServiceBuilder::new().layer(ProxyGetRequestLayer::new(
        methods::HEALTH_CHECK_PATH,
        methods::HEALTH_CHECK,
    )?);
    let server = Server::builder()
        .set_http_middleware(service_builder)
        .build(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let handle = server.start(module(ctx, handler)?);
    ctx.canceled().await;
    // Stopping fails only if the server is already stopped.
    let _ = handle.stop();
    handle.stopped().await;
    Ok(())
}
