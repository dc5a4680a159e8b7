//! Thin wrapper around the generated `ControlPlaneClient` (§6): request
//! construction plus the registration handshake (§4.G "Registration
//! handshake").

use tonic::transport::Channel;
use tonic::{Status, Streaming};

use crate::model::{GlobalId, ProbeRegistration};
use crate::pb::control_plane_client::ControlPlaneClient;
use crate::pb::{AdHocRequestMsg, ChangesMsg, ProbeInfo, StatusCode, Void};

pub struct ControlPlaneTransport {
    client: ControlPlaneClient<Channel>,
}

impl ControlPlaneTransport {
    pub async fn connect(endpoint: String) -> Result<Self, tonic::transport::Error> {
        let channel = Channel::from_shared(endpoint)
            .expect("control plane endpoint must be a valid URI")
            .connect()
            .await?;
        Ok(Self {
            client: ControlPlaneClient::new(channel),
        })
    }

    /// Submits build metadata and capability flags; maps a non-OK status
    /// response into a `Status::permission_denied` so callers only ever
    /// branch on `tonic::Status` (§4.G "not-authorized (status =
    /// PermissionDenied)").
    pub async fn register(
        &mut self,
        version: String,
        commit: String,
        buildstamp: String,
        supports_protocol_secrets: bool,
    ) -> Result<ProbeRegistration, Status> {
        let request = ProbeInfo {
            version,
            commit,
            buildstamp,
            supports_protocol_secrets,
        };
        let response = self.client.register_probe(request).await?.into_inner();

        if response.status == StatusCode::NotAuthorized as i32 {
            return Err(Status::permission_denied(response.message));
        }

        let probe = response
            .probe
            .ok_or_else(|| Status::internal("registration response missing probe identity"))?;

        Ok(ProbeRegistration {
            probe_id: probe.id,
            name: probe.name,
            tenant_id: GlobalId {
                region: 0,
                local_id: probe.tenant_id,
            },
            capabilities: probe.capabilities,
        })
    }

    pub async fn get_ad_hoc_checks(&mut self) -> Result<Streaming<AdHocRequestMsg>, Status> {
        Ok(self.client.get_ad_hoc_checks(Void {}).await?.into_inner())
    }

    pub async fn get_changes(&mut self) -> Result<Streaming<ChangesMsg>, Status> {
        Ok(self.client.get_changes(Void {}).await?.into_inner())
    }
}
