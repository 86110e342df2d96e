//! Request Chaining
//!
//! An `IoChain` services an upstream block by translating it into a block of
//! another type, for example an application read turned into an encoded
//! frame. The downstream request is encoded when the chain is built; the
//! downstream result is decoded back onto the upstream block when it
//! arrives.
//!
//! The chain acts as the upstream block's controller: aborting the upstream
//! block aborts the downstream one, and the downstream result (or a decode
//! failure) is what finishes the upstream block.

use std::sync::{Arc, Weak};

use crate::context::IoContext;
use crate::controller::IoController;
use crate::error::{IocbError, IocbResult};
use crate::iocb::{Iocb, IocbState};

struct ChainShared<UReq, UResp, DReq, DResp> {
    upstream: Iocb<UReq, UResp>,
    downstream: Option<Iocb<DReq, DResp>>,
}

/// Upstream block serviced through a transformed downstream block
pub struct IoChain<UReq, UResp, DReq, DResp> {
    inner: Arc<ChainShared<UReq, UResp, DReq, DResp>>,
}

impl<UReq, UResp, DReq, DResp> Clone for IoChain<UReq, UResp, DReq, DResp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<UReq, UResp, DReq, DResp> IoChain<UReq, UResp, DReq, DResp>
where
    UReq: Send + Sync + 'static,
    UResp: Clone + Send + Sync + 'static,
    DReq: Send + Sync + 'static,
    DResp: Clone + Send + Sync + 'static,
{
    /// Build a chain over an idle upstream block.
    ///
    /// If `encode` fails the upstream block is aborted with
    /// `IocbError::Encode` right away and no downstream block exists. The
    /// chain stays alive until the downstream block finishes.
    pub(crate) fn new<E, D>(ctx: &IoContext, upstream: Iocb<UReq, UResp>, encode: E, decode: D) -> IocbResult<Self>
    where
        E: FnOnce(&UReq) -> anyhow::Result<DReq>,
        D: FnOnce(DResp) -> anyhow::Result<UResp> + Send + 'static,
    {
        let state = upstream.state();
        if state != IocbState::Idle {
            return Err(IocbError::InvalidState(format!(
                "cannot chain iocb {} in state {}",
                upstream.id(),
                state
            )));
        }

        let request = match encode(upstream.request()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to encode iocb {}: {:#}", upstream.id(), e);
                upstream.resolve(Err(IocbError::Encode(format!("{e:#}"))));
                return Ok(Self {
                    inner: Arc::new(ChainShared {
                        upstream,
                        downstream: None,
                    }),
                });
            }
        };

        let downstream: Iocb<DReq, DResp> = ctx.iocb_with_priority(request, upstream.priority());
        let inner = Arc::new(ChainShared {
            upstream,
            downstream: Some(downstream.clone()),
        });

        let weak = Arc::downgrade(&inner);
        let link: Weak<dyn IoController<UReq, UResp>> = weak;
        inner.upstream.bind_active(link)?;

        let shared = Arc::clone(&inner);
        downstream.add_callback(move |outcome| {
            let result = match outcome {
                Ok(response) => decode(response.clone()).map_err(|e| {
                    tracing::warn!("Failed to decode response for iocb {}: {:#}", shared.upstream.id(), e);
                    IocbError::Decode(format!("{e:#}"))
                }),
                Err(err) => Err(err.clone()),
            };

            shared.upstream.unbind();
            shared.upstream.resolve(result);
        });

        tracing::trace!("Chained iocb {} to iocb {}", inner.upstream.id(), downstream.id());
        Ok(Self { inner })
    }

    pub fn upstream(&self) -> &Iocb<UReq, UResp> {
        &self.inner.upstream
    }

    /// Block to hand to the next layer; `None` if encoding failed
    pub fn downstream(&self) -> Option<&Iocb<DReq, DResp>> {
        self.inner.downstream.as_ref()
    }
}

impl<UReq, UResp, DReq, DResp> IoController<UReq, UResp> for ChainShared<UReq, UResp, DReq, DResp>
where
    UReq: Send + Sync + 'static,
    UResp: Clone + Send + Sync + 'static,
    DReq: Send + Sync + 'static,
    DResp: Clone + Send + Sync + 'static,
{
    fn complete_io(&self, iocb: &Iocb<UReq, UResp>, _response: UResp) -> IocbResult<()> {
        if iocb.is_terminal() {
            return Ok(());
        }
        tracing::error!("Iocb {} is chained and completes from its downstream only", iocb.id());
        Err(IocbError::ProtocolViolation(format!(
            "iocb {} is serviced by a chain",
            iocb.id()
        )))
    }

    fn abort_io(&self, iocb: &Iocb<UReq, UResp>, err: IocbError) {
        if !iocb.ptr_eq(&self.upstream) {
            tracing::error!("Chain for iocb {} asked to abort iocb {}", self.upstream.id(), iocb.id());
            return;
        }

        match &self.downstream {
            Some(downstream) => downstream.abort(err),
            None => {
                self.upstream.resolve(Err(err));
            }
        }
    }
}

impl<UReq, UResp, DReq, DResp> std::fmt::Debug for IoChain<UReq, UResp, DReq, DResp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoChain")
            .field("upstream", &self.inner.upstream)
            .field("downstream", &self.inner.downstream)
            .finish()
    }
}
