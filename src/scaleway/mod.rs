//! Scaleway implementation of the instance provisioner.

mod error;

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use scaleway_rs::{
    ScalewayApi, ScalewayCreateInstanceBuilder, ScalewayError, ScalewayImage,
    ScalewayListInstanceImagesBuilder,
};
use tokio::time::sleep;
use uuid::Uuid;

use crate::backend::{
    InstanceHandle, InstanceNetworking, InstanceRequest, Provisioner, ProvisionerFuture,
};
use crate::config::ScalewayConfig;

pub use error::ScalewayProvisionerError;

const DEFAULT_SSH_PORT: u16 = 22;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Provisioner backed by the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvisioner {
    api: ScalewayApi,
    config: ScalewayConfig,
    ssh_port: u16,
    poll_interval: Duration,
}

impl ScalewayProvisioner {
    /// Constructs a new provisioner from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProvisionerError::Config`] when the provided
    /// configuration fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayProvisionerError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Builds an instance request using the provisioner's defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProvisionerError::Config`] when configuration
    /// validation fails.
    pub fn default_request(&self) -> Result<InstanceRequest, ScalewayProvisionerError> {
        self.config
            .as_request()
            .map_err(ScalewayProvisionerError::from)
    }

    fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        request: &InstanceRequest,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == request.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    async fn resolve_image_id(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayProvisionerError> {
        let images = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
            .public(true)
            .name(&request.image_label)
            .arch(&request.architecture)
            .run_async()
            .await?;
        Self::newest_available_image(images, request)
    }

    fn newest_available_image(
        images: Vec<ScalewayImage>,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayProvisionerError> {
        let mut candidates: Vec<ScalewayImage> = images
            .into_iter()
            .filter(|image| image.arch == request.architecture)
            .filter(|image| image.state == "available")
            .collect();

        if candidates.is_empty() {
            return Err(ScalewayProvisionerError::ImageNotFound {
                label: request.image_label.clone(),
                arch: request.architecture.clone(),
                zone: request.zone.clone(),
            });
        }
        candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
        Ok(candidates.remove(0).id)
    }

    async fn launch_one(
        &self,
        request: &InstanceRequest,
        image_id: &str,
    ) -> Result<String, ScalewayProvisionerError> {
        let name = format!("outpost-{}", Uuid::new_v4().simple());
        let server = match ScalewayCreateInstanceBuilder::new(
            self.api.clone(),
            &request.zone,
            &name,
            &request.instance_type,
        )
        .image(image_id)
        .project(&request.project_id)
        .routed_ip_enabled(true)
        .tags(vec![String::from("outpost"), String::from("ephemeral")])
        .run_async()
        .await
        {
            Ok(server) => server,
            Err(ScalewayError::Api(api_err))
                if Self::is_instance_type_error(&api_err, request) =>
            {
                return Err(ScalewayProvisionerError::InstanceTypeUnavailable {
                    instance_type: request.instance_type.clone(),
                    zone: request.zone.clone(),
                });
            }
            Err(other) => return Err(other.into()),
        };

        self.power_on_if_needed(&request.zone, &server).await?;
        Ok(server.id)
    }

    async fn power_on_if_needed(
        &self,
        zone: &str,
        server: &scaleway_rs::ScalewayInstance,
    ) -> Result<(), ScalewayProvisionerError> {
        if server.state == "running" {
            return Ok(());
        }

        if server
            .allowed_actions
            .iter()
            .any(|action| action == "poweron")
        {
            self.api
                .perform_instance_action_async(zone, &server.id, "poweron")
                .await?;
            return Ok(());
        }

        Err(ScalewayProvisionerError::PowerOnNotAllowed {
            instance_id: server.id.clone(),
            state: server.state.clone(),
        })
    }

    /// Best-effort removal of instances launched before a mid-batch failure,
    /// so a rejected launch never strands the earlier ones.
    async fn release_partial_launch(&self, zone: &str, ids: &[String]) {
        for id in ids {
            if let Err(err) = self.api.delete_instance_async(zone, id).await {
                tracing::warn!(
                    instance_id = %id,
                    error = %err,
                    "failed to terminate instance after a partial launch"
                );
            }
        }
    }

    async fn fetch_instance(
        &self,
        zone: &str,
        id: &str,
    ) -> Result<Option<scaleway_rs::ScalewayInstance>, ScalewayProvisionerError> {
        let mut servers = self
            .api
            .list_instances(zone)
            .servers(id)
            .per_page(1)
            .run_async()
            .await?;
        Ok(servers.pop())
    }

    async fn primary_networking(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<InstanceNetworking>, ScalewayProvisionerError> {
        let Some(primary) = handle.primary_id() else {
            return Ok(None);
        };
        let Some(server) = self.fetch_instance(&handle.zone, primary).await? else {
            return Ok(None);
        };

        match server.public_ip {
            None => Ok(None),
            Some(ip) => {
                let address = IpAddr::from_str(&ip.address).map_err(|_| {
                    ScalewayProvisionerError::MissingPublicIp {
                        instance_id: primary.to_owned(),
                    }
                })?;
                Ok(Some(InstanceNetworking {
                    public_ip: address,
                    ssh_port: self.ssh_port,
                }))
            }
        }
    }

    async fn all_running(&self, handle: &InstanceHandle) -> Result<bool, ScalewayProvisionerError> {
        for id in &handle.ids {
            let running = self
                .fetch_instance(&handle.zone, id)
                .await?
                .is_some_and(|server| server.state == "running");
            if !running {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Provisioner for ScalewayProvisioner {
    type Error = ScalewayProvisionerError;

    fn provision<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProvisionerFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let image_id = self.resolve_image_id(request).await?;

            let mut ids = Vec::with_capacity(request.count as usize);
            for _ in 0..request.count {
                match self.launch_one(request, &image_id).await {
                    Ok(id) => ids.push(id),
                    Err(err) => {
                        self.release_partial_launch(&request.zone, &ids).await;
                        return Err(err);
                    }
                }
            }

            Ok(InstanceHandle {
                ids,
                zone: request.zone.clone(),
            })
        })
    }

    fn poll_until_running<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProvisionerFuture<'a, InstanceNetworking, Self::Error> {
        // Deliberately unbounded: the provider either reaches "running" or
        // fails the instances. Callers wanting a wall-clock cap wrap this
        // call with a timeout.
        Box::pin(async move {
            loop {
                if self.all_running(handle).await?
                    && let Some(networking) = self.primary_networking(handle).await?
                {
                    return Ok(networking);
                }
                sleep(self.poll_interval).await;
            }
        })
    }

    fn terminate(&self, handle: InstanceHandle) -> ProvisionerFuture<'_, (), Self::Error> {
        // Every id gets a deletion attempt; the first failure is reported
        // only after the rest of the handle has been tried.
        Box::pin(async move {
            let mut first_error = None;
            for id in &handle.ids {
                if let Err(err) = self.api.delete_instance_async(&handle.zone, id).await {
                    tracing::warn!(instance_id = %id, error = %err, "failed to delete instance");
                    if first_error.is_none() {
                        first_error = Some(ScalewayProvisionerError::from(err));
                    }
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    fn is_transient_teardown(error: &Self::Error) -> bool {
        matches!(error, ScalewayProvisionerError::Provider { .. })
    }
}
