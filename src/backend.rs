//! Provisioner abstraction for disposable compute instances.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Parameters required to launch the instances backing one build action.
///
/// The request is immutable once submitted to a provisioner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Human readable label for the boot image. The provisioner resolves this
    /// to a provider specific image identifier.
    pub image_label: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// CPU architecture requested for the instance.
    pub architecture: String,
    /// Number of instances to launch for this action.
    pub count: u32,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any string field is empty or
    /// the launch count is zero.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.image_label.is_empty() {
            return Err(BackendError::Validation("image_label".to_owned()));
        }
        if self.instance_type.is_empty() {
            return Err(BackendError::Validation("instance_type".to_owned()));
        }
        if self.zone.is_empty() {
            return Err(BackendError::Validation("zone".to_owned()));
        }
        if self.project_id.is_empty() {
            return Err(BackendError::Validation("project_id".to_owned()));
        }
        if self.architecture.is_empty() {
            return Err(BackendError::Validation("architecture".to_owned()));
        }
        if self.count == 0 {
            return Err(BackendError::Validation("count".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    image_label: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    architecture: String,
    count: u32,
}

impl Default for InstanceRequestBuilder {
    fn default() -> Self {
        Self {
            image_label: String::new(),
            instance_type: String::new(),
            zone: String::new(),
            project_id: String::new(),
            organisation_id: None,
            architecture: String::new(),
            count: 1,
        }
    }
}

impl InstanceRequestBuilder {
    /// Creates a builder launching a single instance; fields must be
    /// populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets the launch count.
    #[must_use]
    pub fn count(mut self, value: u32) -> Self {
        self.count = value;
        self
    }

    /// Builds and validates the [`InstanceRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<InstanceRequest, BackendError> {
        let request = InstanceRequest {
            image_label: self.image_label.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: self.organisation_id.map(|value| value.trim().to_owned()),
            architecture: self.architecture.trim().to_owned(),
            count: self.count,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Handle returned by a provisioner once the launch request was accepted.
///
/// The handle is owned by the lifecycle manager and consumed by
/// [`Provisioner::terminate`], so a terminated handle can never be reused for
/// a later connection attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifiers, one per launched instance.
    pub ids: Vec<String>,
    /// Zone in which the instances were created.
    pub zone: String,
}

impl InstanceHandle {
    /// Identifier of the primary instance, when at least one was launched.
    #[must_use]
    pub fn primary_id(&self) -> Option<&str> {
        self.ids.first().map(String::as_str)
    }
}

/// Connection details for reaching the primary instance once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceNetworking {
    /// Public IPv4 address assigned by the provider.
    pub public_ip: IpAddr,
    /// TCP port for SSH (defaults to 22).
    pub ssh_port: u16,
}

/// Errors raised by request validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by provisioner operations.
pub type ProvisionerFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud provisioners.
pub trait Provisioner {
    /// Provider specific error type returned by the provisioner.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits the launch request and returns a handle for subsequent calls.
    ///
    /// Launch rejections (invalid image, quota, authentication) are fatal:
    /// callers must not retry an identical request.
    fn provision<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProvisionerFuture<'a, InstanceHandle, Self::Error>;

    /// Polls at a fixed interval until every instance in the handle reports a
    /// running status, then returns the primary instance's networking.
    ///
    /// The loop has no upper bound; callers wanting a wall-clock cap must
    /// wrap the call with an external timeout.
    fn poll_until_running<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProvisionerFuture<'a, InstanceNetworking, Self::Error>;

    /// Terminates every instance in the handle. Idempotent.
    fn terminate(&self, handle: InstanceHandle) -> ProvisionerFuture<'_, (), Self::Error>;

    /// Reports whether a termination failure belongs to the transient
    /// provider-API class that warrants the delayed self-shutdown fallback.
    fn is_transient_teardown(error: &Self::Error) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_builder() -> InstanceRequestBuilder {
        InstanceRequest::builder()
            .image_label("Ubuntu 24.04 Noble Numbat")
            .instance_type("DEV1-S")
            .zone("fr-par-1")
            .project_id("proj")
            .architecture("x86_64")
    }

    #[test]
    fn builder_trims_and_validates() {
        let request = InstanceRequest::builder()
            .image_label("  img  ")
            .instance_type("DEV1-S")
            .zone("fr-par-1")
            .project_id("proj")
            .architecture("x86_64")
            .build()
            .expect("request should validate");

        assert_eq!(request.image_label, "img");
        assert_eq!(request.count, 1, "builder defaults to one instance");
    }

    #[test]
    fn builder_rejects_empty_fields() {
        let err = full_builder()
            .zone("   ")
            .build()
            .expect_err("blank zone should fail");
        assert_eq!(err, BackendError::Validation("zone".to_owned()));
    }

    #[test]
    fn builder_rejects_zero_count() {
        let err = full_builder()
            .count(0)
            .build()
            .expect_err("zero count should fail");
        assert_eq!(err, BackendError::Validation("count".to_owned()));
    }

    #[test]
    fn primary_id_is_first_launched() {
        let handle = InstanceHandle {
            ids: vec!["a".to_owned(), "b".to_owned()],
            zone: "fr-par-1".to_owned(),
        };
        assert_eq!(handle.primary_id(), Some("a"));
    }
}
