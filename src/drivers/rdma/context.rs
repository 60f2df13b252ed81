use crate::error::{Error, IntoTransportError, Result};
use sideway::ibverbs::completion::GenericCompletionQueue;
use sideway::ibverbs::device::{DeviceInfo, DeviceList};
use sideway::ibverbs::device_context::DeviceContext;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::queue_pair::{GenericQueuePair, QueuePairType};
use std::sync::Arc;

/// An opened device and the protection domain every registration and queue
/// pair of one fabric shares.
pub struct RdmaContext {
    pub(crate) ctx: Arc<DeviceContext>,
    pub(crate) pd: Arc<ProtectionDomain>,
}

// SAFETY: the device context and protection domain are reference-counted
// ibverbs objects; verbs calls on them are thread-safe.
unsafe impl Send for RdmaContext {}
unsafe impl Sync for RdmaContext {}

impl RdmaContext {
    pub fn open(dev_name: &str) -> Result<Arc<Self>> {
        let device_list = DeviceList::new().transport_err()?;
        let device = device_list
            .iter()
            .find(|d| d.name() == dev_name)
            .ok_or_else(|| Error::Config(format!("device {dev_name} not found")))?;
        let ctx = device.open().transport_err()?;
        Self::from_device_context(ctx)
    }

    pub fn from_device_context(ctx: Arc<DeviceContext>) -> Result<Arc<Self>> {
        let pd = ctx.alloc_pd().transport_err()?;
        Ok(Arc::new(Self { ctx, pd }))
    }

    pub(crate) fn create_cq(&self, cqe: u32) -> Result<GenericCompletionQueue> {
        Ok(self
            .ctx
            .create_cq_builder()
            .setup_cqe(cqe)
            .build()
            .transport_err()?
            .into())
    }

    /// Reliable-connection queue pair with both queues on `cq`.
    pub(crate) fn create_qp(
        &self,
        cq: &GenericCompletionQueue,
        max_send_wr: u32,
        max_recv_wr: u32,
    ) -> Result<GenericQueuePair> {
        let mut builder = self.pd.create_qp_builder();
        builder.setup_send_cq(cq.clone());
        builder.setup_recv_cq(cq.clone());
        builder.setup_qp_type(QueuePairType::ReliableConnection);
        builder
            .setup_max_send_wr(max_send_wr.max(1))
            .setup_max_send_sge(1)
            .setup_max_recv_wr(max_recv_wr.max(1))
            .setup_max_recv_sge(1);
        let qp = builder.build().transport_err()?;
        Ok(GenericQueuePair::Basic(qp))
    }
}
