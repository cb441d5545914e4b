//! Built-in sandbox providers.
//!
//! Each sandbox type simulates one cloud resource type (AWS EC2 instance and
//! S3 bucket, Azure VM and storage blob, GCP compute instance and storage
//! bucket) by persisting it as a JSON document under a local directory. Ids
//! and computed outputs follow the formats of the real clouds so that
//! references between resources look the same as they would in production.

use crate::config::{Attributes, ResourceId};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::registry::ResourceSchema;
use super::traits::{ProviderResponse, ResourceProvider};

/// Placeholder account/subscription used in simulated ids.
const SANDBOX_ACCOUNT: &str = "000000000000";
const SANDBOX_SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

/// The simulated resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    /// `aws.instance`
    AwsInstance,
    /// `aws.s3_bucket`
    AwsS3Bucket,
    /// `azurerm.virtual_machine`
    AzureVirtualMachine,
    /// `azurerm.storage_blob`
    AzureStorageBlob,
    /// `google.compute_instance`
    GoogleComputeInstance,
    /// `google.storage_bucket`
    GoogleStorageBucket,
}

impl SandboxKind {
    /// Every sandbox kind.
    pub const ALL: [Self; 6] = [
        Self::AwsInstance,
        Self::AwsS3Bucket,
        Self::AzureVirtualMachine,
        Self::AzureStorageBlob,
        Self::GoogleComputeInstance,
        Self::GoogleStorageBucket,
    ];

    /// `(provider, type)` pair served by this kind.
    #[must_use]
    pub const fn pair(self) -> (&'static str, &'static str) {
        match self {
            Self::AwsInstance => ("aws", "instance"),
            Self::AwsS3Bucket => ("aws", "s3_bucket"),
            Self::AzureVirtualMachine => ("azurerm", "virtual_machine"),
            Self::AzureStorageBlob => ("azurerm", "storage_blob"),
            Self::GoogleComputeInstance => ("google", "compute_instance"),
            Self::GoogleStorageBucket => ("google", "storage_bucket"),
        }
    }

    /// Schema of this kind.
    #[must_use]
    pub fn schema(self) -> ResourceSchema {
        let (provider, resource_type) = self.pair();
        let schema = ResourceSchema::new(provider, resource_type);
        match self {
            Self::AwsInstance => schema
                .with_required(&["ami", "instance_type"])
                .with_immutable(&["ami"])
                .with_outputs(&["arn", "private_ip", "public_dns"]),
            Self::AwsS3Bucket => schema
                .with_required(&["bucket"])
                .with_immutable(&["bucket"])
                .with_outputs(&["arn", "bucket_domain_name"]),
            Self::AzureVirtualMachine => schema
                .with_required(&["location", "vm_size"])
                .with_immutable(&["location"])
                .with_outputs(&["private_ip_address"]),
            Self::AzureStorageBlob => schema
                .with_required(&["storage_account_name", "storage_container_name"])
                .with_immutable(&["storage_account_name", "storage_container_name"])
                .with_outputs(&["url"]),
            Self::GoogleComputeInstance => schema
                .with_required(&["machine_type", "zone"])
                .with_immutable(&["zone"])
                .with_outputs(&["self_link", "network_ip"]),
            Self::GoogleStorageBucket => schema
                .with_required(&["location"])
                .with_immutable(&["location"])
                .with_outputs(&["self_link", "url"]),
        }
    }

    fn assign_id(self, id: &ResourceId, attributes: &Attributes) -> String {
        let name = string_attr(attributes, "name").unwrap_or(&id.name);
        match self {
            Self::AwsInstance => format!("i-{}", &Uuid::new_v4().simple().to_string()[..17]),
            Self::AwsS3Bucket => string_attr(attributes, "bucket").unwrap_or(name).to_string(),
            Self::AzureVirtualMachine => format!(
                "/subscriptions/{SANDBOX_SUBSCRIPTION}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{name}",
                string_attr(attributes, "resource_group_name").unwrap_or("sandbox-rg")
            ),
            Self::AzureStorageBlob => format!(
                "https://{}.blob.core.windows.net/{}/{name}",
                string_attr(attributes, "storage_account_name").unwrap_or("sandbox"),
                string_attr(attributes, "storage_container_name").unwrap_or("default")
            ),
            Self::GoogleComputeInstance => format!(
                "projects/{}/zones/{}/instances/{name}",
                string_attr(attributes, "project").unwrap_or("sandbox-project"),
                string_attr(attributes, "zone").unwrap_or("us-central1-a")
            ),
            Self::GoogleStorageBucket => name.to_string(),
        }
    }

    fn outputs(self, provider_id: &str, attributes: &Attributes) -> Attributes {
        let mut outputs = Attributes::new();
        match self {
            Self::AwsInstance => {
                let region = string_attr(attributes, "region").unwrap_or("us-east-1");
                let ip = private_ip(provider_id);
                outputs.insert(
                    String::from("arn"),
                    json!(format!("arn:aws:ec2:{region}:{SANDBOX_ACCOUNT}:instance/{provider_id}")),
                );
                outputs.insert(
                    String::from("public_dns"),
                    json!(format!("ec2-{}.compute-1.amazonaws.com", ip.replace('.', "-"))),
                );
                outputs.insert(String::from("private_ip"), json!(ip));
            }
            Self::AwsS3Bucket => {
                outputs.insert(String::from("arn"), json!(format!("arn:aws:s3:::{provider_id}")));
                outputs.insert(
                    String::from("bucket_domain_name"),
                    json!(format!("{provider_id}.s3.amazonaws.com")),
                );
            }
            Self::AzureVirtualMachine => {
                outputs.insert(String::from("private_ip_address"), json!(private_ip(provider_id)));
            }
            Self::AzureStorageBlob => {
                outputs.insert(String::from("url"), json!(provider_id));
            }
            Self::GoogleComputeInstance => {
                outputs.insert(
                    String::from("self_link"),
                    json!(format!("https://www.googleapis.com/compute/v1/{provider_id}")),
                );
                outputs.insert(String::from("network_ip"), json!(private_ip(provider_id)));
            }
            Self::GoogleStorageBucket => {
                outputs.insert(
                    String::from("self_link"),
                    json!(format!("https://www.googleapis.com/storage/v1/b/{provider_id}")),
                );
                outputs.insert(String::from("url"), json!(format!("gs://{provider_id}")));
            }
        }
        outputs
    }
}

fn string_attr<'a>(attributes: &'a Attributes, key: &str) -> Option<&'a str> {
    attributes.get(key).and_then(Value::as_str)
}

/// Deterministic private address derived from the provider id.
fn private_ip(provider_id: &str) -> String {
    let sum = provider_id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    format!("10.0.{}.{}", (sum >> 8) % 256, (sum % 254) + 1)
}

/// A simulated resource as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxDocument {
    provider_id: String,
    attributes: Attributes,
    outputs: Attributes,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SandboxDocument> for ProviderResponse {
    fn from(doc: SandboxDocument) -> Self {
        Self {
            provider_id: doc.provider_id,
            attributes: doc.attributes,
            outputs: doc.outputs,
        }
    }
}

/// Sandbox provider for one kind.
#[derive(Debug, Clone)]
pub struct SandboxProvider {
    root: PathBuf,
    kind: SandboxKind,
}

impl SandboxProvider {
    /// Creates a sandbox provider storing documents under `root`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>, kind: SandboxKind) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            kind,
        }
    }

    fn document_path(&self, id: &ResourceId) -> PathBuf {
        self.root
            .join(&id.provider)
            .join(&id.resource_type)
            .join(format!("{}.json", id.name))
    }

    async fn load(&self, id: &ResourceId) -> ProviderResult<Option<SandboxDocument>> {
        let path = self.document_path(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProviderError::transient(
                    id.to_string(),
                    format!("Failed to read {}: {e}", path.display()),
                ));
            }
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            ProviderError::fatal(id.to_string(), format!("Corrupted sandbox document: {e}"))
        })
    }

    async fn load_existing(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<SandboxDocument> {
        match self.load(id).await? {
            Some(doc) if doc.provider_id == provider_id => Ok(doc),
            _ => Err(ProviderError::NotFound {
                resource: id.to_string(),
                provider_id: provider_id.to_string(),
            }),
        }
    }

    async fn store(&self, id: &ResourceId, doc: &SandboxDocument) -> ProviderResult<()> {
        let path = self.document_path(id);
        let transient = |e: std::io::Error| {
            ProviderError::transient(id.to_string(), format!("Failed to write {}: {e}", path.display()))
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transient)?;
        }

        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| ProviderError::fatal(id.to_string(), e.to_string()))?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content).await.map_err(transient)?;
        tokio::fs::rename(&temp_path, &path).await.map_err(transient)?;
        Ok(())
    }

    fn check_required(&self, id: &ResourceId, attributes: &Attributes) -> ProviderResult<()> {
        let schema = self.kind.schema();
        match schema.required.iter().find(|key| !attributes.contains_key(*key)) {
            Some(key) => Err(ProviderError::fatal(
                id.to_string(),
                format!("missing required attribute '{key}'"),
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceProvider for SandboxProvider {
    async fn create(&self, id: &ResourceId, attributes: &Attributes) -> ProviderResult<ProviderResponse> {
        self.check_required(id, attributes)?;

        if let Some(existing) = self.load(id).await? {
            return Err(ProviderError::fatal(
                id.to_string(),
                format!("resource already exists with id {}", existing.provider_id),
            ));
        }

        let provider_id = self.kind.assign_id(id, attributes);
        let now = Utc::now();
        let doc = SandboxDocument {
            outputs: self.kind.outputs(&provider_id, attributes),
            provider_id,
            attributes: attributes.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store(id, &doc).await?;

        info!("Sandbox created {id} ({})", doc.provider_id);
        Ok(doc.into())
    }

    async fn read(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<ProviderResponse> {
        let doc = self.load_existing(id, provider_id).await?;
        debug!("Sandbox read {id} ({provider_id})");
        Ok(doc.into())
    }

    async fn update(
        &self,
        id: &ResourceId,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderResponse> {
        self.check_required(id, attributes)?;
        let mut doc = self.load_existing(id, provider_id).await?;

        for key in &self.kind.schema().immutable {
            if doc.attributes.get(key) != attributes.get(key) {
                return Err(ProviderError::fatal(
                    id.to_string(),
                    format!("attribute '{key}' cannot be changed in place"),
                ));
            }
        }

        doc.attributes = attributes.clone();
        doc.outputs = self.kind.outputs(provider_id, attributes);
        doc.updated_at = Utc::now();
        self.store(id, &doc).await?;

        info!("Sandbox updated {id} ({provider_id})");
        Ok(doc.into())
    }

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<()> {
        self.load_existing(id, provider_id).await?;
        tokio::fs::remove_file(self.document_path(id))
            .await
            .map_err(|e| ProviderError::transient(id.to_string(), format!("Failed to delete: {e}")))?;

        info!("Sandbox deleted {id} ({provider_id})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance_attrs() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("ami"), json!("ami-0c55b159"));
        attributes.insert(String::from("instance_type"), json!("t3.micro"));
        attributes
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let provider = SandboxProvider::new(temp_dir.path(), SandboxKind::AwsInstance);
        let id = ResourceId::new("aws", "instance", "web");

        let created = provider
            .create(&id, &instance_attrs())
            .await
            .expect("create should succeed");
        assert!(created.provider_id.starts_with("i-"));
        assert_eq!(created.provider_id.len(), 19);
        assert!(created.outputs.contains_key("arn"));

        let read = provider
            .read(&id, &created.provider_id)
            .await
            .expect("read should succeed");
        assert_eq!(read, created);

        let mut changed = instance_attrs();
        changed.insert(String::from("instance_type"), json!("t3.large"));
        let updated = provider
            .update(&id, &created.provider_id, &changed)
            .await
            .expect("update should succeed");
        assert_eq!(updated.provider_id, created.provider_id);
        assert_eq!(updated.attributes["instance_type"], json!("t3.large"));

        provider
            .delete(&id, &created.provider_id)
            .await
            .expect("delete should succeed");
        let gone = provider.read(&id, &created.provider_id).await;
        assert!(matches!(gone, Err(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_immutable_attribute_rejected() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let provider = SandboxProvider::new(temp_dir.path(), SandboxKind::AwsInstance);
        let id = ResourceId::new("aws", "instance", "web");
        let created = provider
            .create(&id, &instance_attrs())
            .await
            .expect("create should succeed");

        let mut changed = instance_attrs();
        changed.insert(String::from("ami"), json!("ami-other"));
        let result = provider.update(&id, &created.provider_id, &changed).await;

        assert!(matches!(result, Err(ProviderError::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_missing_required_is_fatal() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let provider = SandboxProvider::new(temp_dir.path(), SandboxKind::AwsS3Bucket);
        let id = ResourceId::new("aws", "s3_bucket", "assets");

        let result = provider.create(&id, &Attributes::new()).await;
        assert!(matches!(result, Err(ProviderError::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_cloud_id_formats() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let azure = SandboxProvider::new(temp_dir.path(), SandboxKind::AzureVirtualMachine);
        let mut attrs = Attributes::new();
        attrs.insert(String::from("location"), json!("westeurope"));
        attrs.insert(String::from("vm_size"), json!("Standard_B1s"));
        let vm = azure
            .create(&ResourceId::new("azurerm", "virtual_machine", "app"), &attrs)
            .await
            .expect("create should succeed");
        assert!(vm.provider_id.ends_with("/providers/Microsoft.Compute/virtualMachines/app"));

        let gcp = SandboxProvider::new(temp_dir.path(), SandboxKind::GoogleStorageBucket);
        let mut attrs = Attributes::new();
        attrs.insert(String::from("name"), json!("media-bucket"));
        attrs.insert(String::from("location"), json!("EU"));
        let bucket = gcp
            .create(&ResourceId::new("google", "storage_bucket", "media"), &attrs)
            .await
            .expect("create should succeed");
        assert_eq!(bucket.provider_id, "media-bucket");
        assert_eq!(bucket.outputs["url"], json!("gs://media-bucket"));
    }
}
