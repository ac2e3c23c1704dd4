//! gRPC ShoalService implementation.

use super::proto::shoal_service_server::ShoalService;
use super::proto::{
    self, DaemonStatus, GetStatusRequest, GetVersionRequest, ListRemotesRequest,
    ListRemotesResponse, RemoteChange, RemoveRemoteRequest, RemoveRemoteResponse,
    SetFakeGatewayIpRequest, SetSwitchIpRequest, SetSwitchMacRequest, UpsertRemoteRequest,
    UpsertRemoteResponse, VersionInfo, WatchSwitchRequest,
};
use super::validation::{
    ValidationError, parse_ipv4, parse_mac, parse_optional_ipv4, validate_upsert_remote,
};
use crate::ebpf_loader::EbpfError;
use crate::fatal::FatalSignal;
use crate::remote::{RegistryChange, RemoteRegistry};
use crate::switch::{SwitchIdentity, SwitchTracker};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::info;

/// Version string for GetVersion RPC.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convert validation error to gRPC status.
fn validation_err_to_status(e: ValidationError) -> Status {
    Status::invalid_argument(e.to_string())
}

fn identity_to_proto(identity: &SwitchIdentity) -> proto::SwitchIdentity {
    proto::SwitchIdentity {
        mac: identity.mac.to_string(),
        ip: identity.ip.to_string(),
    }
}

fn change_to_proto(change: RegistryChange) -> i32 {
    let change = match change {
        RegistryChange::Ignored => RemoteChange::Ignored,
        RegistryChange::Inserted => RemoteChange::Inserted,
        RegistryChange::Updated => RemoteChange::Updated,
        RegistryChange::Removed => RemoteChange::Removed,
    };
    change as i32
}

/// Publish every switch identity change into a watch channel.
///
/// The observer holds only a weak reference to the tracker that owns it.
pub fn watch_switch_changes(switch: &Arc<SwitchTracker>) -> watch::Receiver<SwitchIdentity> {
    let (tx, rx) = watch::channel(switch.current());
    let tracker = Arc::downgrade(switch);
    switch.register_change_observer(move || {
        if let Some(tracker) = tracker.upgrade() {
            tx.send_replace(tracker.current());
        }
    });
    rx
}

/// gRPC service implementation.
pub struct ShoalServiceImpl {
    switch: Arc<SwitchTracker>,
    registry: Arc<RemoteRegistry>,
    changes: watch::Receiver<SwitchIdentity>,
    fatal: Arc<FatalSignal>,
    socket_slots: u32,
}

impl ShoalServiceImpl {
    pub fn new(
        switch: Arc<SwitchTracker>,
        registry: Arc<RemoteRegistry>,
        changes: watch::Receiver<SwitchIdentity>,
        fatal: Arc<FatalSignal>,
        socket_slots: u32,
    ) -> Self {
        Self {
            switch,
            registry,
            changes,
            fatal,
            socket_slots,
        }
    }

    /// A failed kernel push leaves the forwarding plane inconsistent: stop
    /// the daemon and fail the call.
    fn kernel_failure(&self, operation: &str, e: EbpfError) -> Status {
        self.fatal.raise(operation, &e);
        Status::internal(format!("{operation} failed: {e}"))
    }

    fn status(&self) -> DaemonStatus {
        let policy = self.switch.policy();
        DaemonStatus {
            switch: Some(identity_to_proto(&self.switch.current())),
            fake_gateway_ip: policy
                .fake_gateway_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            subnet_mask: policy.subnet_mask.to_string(),
            vpn_port: u32::from(policy.vpn_port),
            socket_slots: self.socket_slots,
            remote_count: self.registry.len() as u32,
        }
    }
}

type SwitchStream =
    Pin<Box<dyn Stream<Item = Result<proto::SwitchIdentity, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl ShoalService for ShoalServiceImpl {
    type WatchSwitchStream = SwitchStream;

    async fn get_version(
        &self,
        _request: Request<GetVersionRequest>,
    ) -> Result<Response<VersionInfo>, Status> {
        Ok(Response::new(VersionInfo {
            version: VERSION.to_string(),
        }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<DaemonStatus>, Status> {
        Ok(Response::new(self.status()))
    }

    // ========== Switch identity ==========

    async fn set_switch_ip(
        &self,
        request: Request<SetSwitchIpRequest>,
    ) -> Result<Response<proto::SwitchIdentity>, Status> {
        let req = request.into_inner();
        let ip = parse_ipv4("ip", &req.ip).map_err(validation_err_to_status)?;
        self.switch
            .set_switch_ip(ip)
            .map_err(|e| self.kernel_failure("set switch IP", e))?;
        Ok(Response::new(identity_to_proto(&self.switch.current())))
    }

    async fn set_switch_mac(
        &self,
        request: Request<SetSwitchMacRequest>,
    ) -> Result<Response<proto::SwitchIdentity>, Status> {
        let req = request.into_inner();
        let mac = parse_mac(&req.mac).map_err(validation_err_to_status)?;
        self.switch
            .set_switch_mac(mac)
            .map_err(|e| self.kernel_failure("set switch MAC", e))?;
        Ok(Response::new(identity_to_proto(&self.switch.current())))
    }

    async fn set_fake_gateway_ip(
        &self,
        request: Request<SetFakeGatewayIpRequest>,
    ) -> Result<Response<DaemonStatus>, Status> {
        let req = request.into_inner();
        let ip = parse_optional_ipv4(&req.ip).map_err(validation_err_to_status)?;
        self.switch
            .set_fake_gateway_ip(ip)
            .map_err(|e| self.kernel_failure("set fake gateway", e))?;
        Ok(Response::new(self.status()))
    }

    async fn watch_switch(
        &self,
        _request: Request<WatchSwitchRequest>,
    ) -> Result<Response<Self::WatchSwitchStream>, Status> {
        let stream = WatchStream::new(self.changes.clone())
            .map(|identity| Ok(identity_to_proto(&identity)));
        Ok(Response::new(Box::pin(stream)))
    }

    // ========== Remotes ==========

    async fn upsert_remote(
        &self,
        request: Request<UpsertRemoteRequest>,
    ) -> Result<Response<UpsertRemoteResponse>, Status> {
        let req = request.into_inner();
        let (local_ip, remote_ip, remote_port) =
            validate_upsert_remote(&req.local_ip, &req.remote_ip, req.remote_port)
                .map_err(validation_err_to_status)?;

        let change = self
            .registry
            .upsert(local_ip, remote_ip, remote_port)
            .map_err(|e| self.kernel_failure("upsert remote", e))?;
        Ok(Response::new(UpsertRemoteResponse {
            change: change_to_proto(change),
        }))
    }

    async fn remove_remote(
        &self,
        request: Request<RemoveRemoteRequest>,
    ) -> Result<Response<RemoveRemoteResponse>, Status> {
        let req = request.into_inner();
        let local_ip = parse_ipv4("local_ip", &req.local_ip).map_err(validation_err_to_status)?;

        let change = self
            .registry
            .remove(local_ip)
            .map_err(|e| self.kernel_failure("remove remote", e))?;
        Ok(Response::new(RemoveRemoteResponse {
            change: change_to_proto(change),
        }))
    }

    async fn list_remotes(
        &self,
        _request: Request<ListRemotesRequest>,
    ) -> Result<Response<ListRemotesResponse>, Status> {
        let remotes = self
            .registry
            .snapshot()
            .into_iter()
            .map(|(local_ip, endpoint)| proto::Remote {
                local_ip: local_ip.to_string(),
                remote_ip: endpoint.remote_ip.to_string(),
                remote_port: u32::from(endpoint.remote_port),
            })
            .collect::<Vec<_>>();
        info!(count = remotes.len(), "Listed remotes");
        Ok(Response::new(ListRemotesResponse { remotes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::mirror::ForwardingMirror;
    use crate::test_util::{
        CapturingTransmit, MirrorHandle, RecordingMirror, RecordingTable, TableHandle,
        test_static_identity,
    };
    use std::net::Ipv4Addr;
    use tonic::Code;

    struct Fixture {
        service: ShoalServiceImpl,
        fatal: Arc<FatalSignal>,
        mirror: MirrorHandle,
        table: TableHandle,
    }

    fn fixture() -> Fixture {
        let switch = Arc::new(SwitchTracker::new(ForwardingMirror::new(Ipv4Addr::new(
            255, 255, 0, 0,
        ))));
        let (store, mirror) = RecordingMirror::new();
        switch
            .install_mirror(Box::new(store), test_static_identity())
            .unwrap();

        let registry = Arc::new(RemoteRegistry::new(
            Arc::clone(&switch),
            CapturingTransmit::new(),
            Arc::new(AuditLogger::new_noop()),
        ));
        let (remote_table, table) = RecordingTable::new();
        registry.install_table(Box::new(remote_table)).unwrap();

        let changes = watch_switch_changes(&switch);
        let fatal = Arc::new(FatalSignal::new());
        let service = ShoalServiceImpl::new(switch, registry, changes, Arc::clone(&fatal), 4);
        Fixture {
            service,
            fatal,
            mirror,
            table,
        }
    }

    #[tokio::test]
    async fn test_status_reports_policy() {
        let f = fixture();
        let status = f
            .service
            .get_status(Request::new(GetStatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.subnet_mask, "255.255.0.0");
        assert_eq!(status.fake_gateway_ip, "");
        assert_eq!(status.vpn_port, 41000);
        assert_eq!(status.socket_slots, 4);
        assert_eq!(status.switch.unwrap().ip, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_set_switch_identity() {
        let f = fixture();
        f.service
            .set_switch_mac(Request::new(SetSwitchMacRequest {
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
            }))
            .await
            .unwrap();
        let identity = f
            .service
            .set_switch_ip(Request::new(SetSwitchIpRequest {
                ip: "10.0.0.1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(identity.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(identity.ip, "10.0.0.1");
        assert_eq!(f.mirror.block().switch_ip, [10, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let f = fixture();
        let err = f
            .service
            .set_switch_ip(Request::new(SetSwitchIpRequest {
                ip: "10.0.0".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = f
            .service
            .upsert_remote(Request::new(UpsertRemoteRequest {
                local_ip: "10.0.0.5".to_string(),
                remote_ip: "203.0.113.9".to_string(),
                remote_port: 70000,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(f.fatal.reason().is_none());
    }

    #[tokio::test]
    async fn test_fake_gateway_set_and_clear() {
        let f = fixture();
        let status = f
            .service
            .set_fake_gateway_ip(Request::new(SetFakeGatewayIpRequest {
                ip: "10.13.37.254".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.fake_gateway_ip, "10.13.37.254");
        assert_eq!(status.subnet_mask, "255.255.255.0");

        let status = f
            .service
            .set_fake_gateway_ip(Request::new(SetFakeGatewayIpRequest { ip: String::new() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.fake_gateway_ip, "");
        assert_eq!(status.subnet_mask, "255.255.0.0");
    }

    #[tokio::test]
    async fn test_upsert_list_remove() {
        let f = fixture();
        let resp = f
            .service
            .upsert_remote(Request::new(UpsertRemoteRequest {
                local_ip: "10.0.0.5".to_string(),
                remote_ip: "203.0.113.9".to_string(),
                remote_port: 40000,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.change, RemoteChange::Inserted as i32);
        assert_eq!(f.table.push_count(), 1);

        let list = f
            .service
            .list_remotes(Request::new(ListRemotesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            list.remotes,
            vec![proto::Remote {
                local_ip: "10.0.0.5".to_string(),
                remote_ip: "203.0.113.9".to_string(),
                remote_port: 40000,
            }]
        );

        let resp = f
            .service
            .remove_remote(Request::new(RemoveRemoteRequest {
                local_ip: "10.0.0.5".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.change, RemoteChange::Removed as i32);

        let resp = f
            .service
            .remove_remote(Request::new(RemoveRemoteRequest {
                local_ip: "10.0.0.5".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.change, RemoteChange::Ignored as i32);
    }

    #[tokio::test]
    async fn test_kernel_push_failure_is_fatal() {
        let f = fixture();
        f.table.fail_next();
        let err = f
            .service
            .upsert_remote(Request::new(UpsertRemoteRequest {
                local_ip: "10.0.0.5".to_string(),
                remote_ip: "203.0.113.9".to_string(),
                remote_port: 40000,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(f.fatal.reason().unwrap().starts_with("upsert remote"));
    }

    #[tokio::test]
    async fn test_watch_switch_streams_changes() {
        let f = fixture();
        let mut stream = f
            .service
            .watch_switch(Request::new(WatchSwitchRequest {}))
            .await
            .unwrap()
            .into_inner();

        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.ip, "0.0.0.0");

        f.service.switch.set_switch_ip(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let changed = stream.next().await.unwrap().unwrap();
        assert_eq!(changed.ip, "10.0.0.1");
    }
}
