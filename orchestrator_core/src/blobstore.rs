//! Object storage client used for datasets, algorithm archives, and job artifacts.

use async_trait::async_trait;
use bytes::Bytes;
use educe::Educe;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    path::Path,
};
use trainyard_core::url_ensure_trailing_slash;
use url::Url;

#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util;

/// Errors returned by object storage operations. Storage failures are surfaced to the caller
/// unchanged; this client does not retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {status} for object {bucket}/{key}")]
    Status {
        bucket: String,
        key: String,
        status: StatusCode,
    },
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The semantic storage areas used by the orchestrator. Each resolves to a concrete bucket name
/// through a [`BucketConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketKind {
    Model,
    Metrics,
    TrainDataset,
    PredictDataset,
    PredictionResults,
    CustomAlgorithm,
    Parameters,
}

impl Display for BucketKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Model => "model",
            Self::Metrics => "metrics",
            Self::TrainDataset => "train_dataset",
            Self::PredictDataset => "predict_dataset",
            Self::PredictionResults => "prediction_results",
            Self::CustomAlgorithm => "custom_algorithm",
            Self::Parameters => "parameters",
        })
    }
}

/// Maps the semantic storage areas to concrete bucket names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Bucket holding trained model artifacts.
    #[serde(default = "BucketConfig::default_models")]
    pub models: String,
    /// Bucket holding training evaluation metrics.
    #[serde(default = "BucketConfig::default_metrics")]
    pub metrics: String,
    /// Bucket holding uploaded training datasets.
    #[serde(default = "BucketConfig::default_datasets")]
    pub datasets: String,
    /// Bucket holding uploaded prediction datasets.
    #[serde(default = "BucketConfig::default_predictions")]
    pub predictions: String,
    /// Bucket holding prediction result files.
    #[serde(default = "BucketConfig::default_results")]
    pub results: String,
    /// Bucket holding user-supplied algorithm image archives.
    #[serde(default = "BucketConfig::default_algorithms")]
    pub algorithms: String,
    /// Bucket holding user-supplied parameter files.
    #[serde(default = "BucketConfig::default_parameters")]
    pub parameters: String,
}

impl BucketConfig {
    /// Returns the bucket name for the given storage area.
    pub fn resolve(&self, kind: BucketKind) -> &str {
        match kind {
            BucketKind::Model => &self.models,
            BucketKind::Metrics => &self.metrics,
            BucketKind::TrainDataset => &self.datasets,
            BucketKind::PredictDataset => &self.predictions,
            BucketKind::PredictionResults => &self.results,
            BucketKind::CustomAlgorithm => &self.algorithms,
            BucketKind::Parameters => &self.parameters,
        }
    }

    fn default_models() -> String {
        "models".into()
    }

    fn default_metrics() -> String {
        "metrics".into()
    }

    fn default_datasets() -> String {
        "datasets".into()
    }

    fn default_predictions() -> String {
        "predictions".into()
    }

    fn default_results() -> String {
        "results".into()
    }

    fn default_algorithms() -> String {
        "algorithms".into()
    }

    fn default_parameters() -> String {
        "parameters".into()
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            models: Self::default_models(),
            metrics: Self::default_metrics(),
            datasets: Self::default_datasets(),
            predictions: Self::default_predictions(),
            results: Self::default_results(),
            algorithms: Self::default_algorithms(),
            parameters: Self::default_parameters(),
        }
    }
}

/// An object store used to persist datasets, algorithm archives, and job artifacts. Objects are
/// addressed by bucket name and key.
#[async_trait]
pub trait BlobStore: Debug + Send + Sync {
    /// Uploads an object, replacing any existing object at the same key.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), Error>;

    /// Downloads an object into memory.
    async fn download(&self, bucket: &str, key: &str) -> Result<Bytes, Error>;

    /// Deletes an object.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), Error>;

    /// Downloads an object and writes it to the given path.
    async fn download_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), Error> {
        let body = self.download(bucket, key).await?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }

    /// Reads a local file and uploads its contents.
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        source: &Path,
    ) -> Result<(), Error> {
        let body = tokio::fs::read(source).await?;
        self.upload(bucket, key, content_type, Bytes::from(body))
            .await
    }
}

/// A [`BlobStore`] speaking plain HTTP with S3-style path addressing
/// (`{base_url}/{bucket}/{key}`).
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct HttpBlobStore {
    http_client: reqwest::Client,
    base_url: Url,
    #[educe(Debug(ignore))]
    auth_token: Option<String>,
}

impl HttpBlobStore {
    /// Creates a new client addressing objects under `base_url`. If an auth token is provided, it
    /// is sent as a bearer token with each request.
    pub fn new(http_client: reqwest::Client, base_url: Url, auth_token: Option<String>) -> Self {
        Self {
            http_client,
            base_url: url_ensure_trailing_slash(base_url),
            auth_token,
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(&format!("{bucket}/{key}"))?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), Error> {
        let response = self
            .authorize(self.http_client.put(self.object_url(bucket, key)?))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                bucket: bucket.to_string(),
                key: key.to_string(),
                status: response.status(),
            });
        }
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Bytes, Error> {
        let response = self
            .authorize(self.http_client.get(self.object_url(bucket, key)?))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status if !status.is_success() => Err(Error::Status {
                bucket: bucket.to_string(),
                key: key.to_string(),
                status,
            }),
            _ => Ok(response.bytes().await?),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), Error> {
        let response = self
            .authorize(self.http_client.delete(self.object_url(bucket, key)?))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status if !status.is_success() => Err(Error::Status {
                bucket: bucket.to_string(),
                key: key.to_string(),
                status,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::blobstore::{BlobStore, BucketConfig, BucketKind, Error, HttpBlobStore};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use trainyard_core::{initialize_rustls, test_util::install_test_trace_subscriber};
    use url::Url;

    fn blobstore_for(server: &mockito::ServerGuard, auth_token: Option<String>) -> HttpBlobStore {
        initialize_rustls();
        HttpBlobStore::new(
            reqwest::Client::new(),
            Url::parse(&server.url()).unwrap(),
            auth_token,
        )
    }

    #[test]
    fn bucket_resolution() {
        let buckets = BucketConfig::default();
        assert_eq!(buckets.resolve(BucketKind::Model), "models");
        assert_eq!(buckets.resolve(BucketKind::Metrics), "metrics");
        assert_eq!(buckets.resolve(BucketKind::TrainDataset), "datasets");
        assert_eq!(buckets.resolve(BucketKind::PredictDataset), "predictions");
        assert_eq!(buckets.resolve(BucketKind::PredictionResults), "results");
        assert_eq!(buckets.resolve(BucketKind::CustomAlgorithm), "algorithms");
        assert_eq!(buckets.resolve(BucketKind::Parameters), "parameters");
    }

    #[tokio::test]
    async fn upload_object() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_put = server
            .mock("PUT", "/models/ada_20250701120000_model.bin")
            .match_header("content-type", "application/octet-stream")
            .match_body(b"model bytes".to_vec())
            .with_status(200)
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, None);
        blobstore
            .upload(
                "models",
                "ada_20250701120000_model.bin",
                "application/octet-stream",
                Bytes::from_static(b"model bytes"),
            )
            .await
            .unwrap();

        mocked_put.assert_async().await;
    }

    #[tokio::test]
    async fn upload_sends_bearer_token() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_put = server
            .mock("PUT", "/metrics/metrics.json")
            .match_header("authorization", "Bearer sekrit")
            .with_status(200)
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, Some("sekrit".to_string()));
        blobstore
            .upload(
                "metrics",
                "metrics.json",
                "application/json",
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap();

        mocked_put.assert_async().await;
    }

    #[tokio::test]
    async fn upload_error_status() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_put = server
            .mock("PUT", "/models/model.bin")
            .with_status(503)
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, None);
        let rslt = blobstore
            .upload(
                "models",
                "model.bin",
                "application/octet-stream",
                Bytes::from_static(b"model bytes"),
            )
            .await;
        assert_matches!(
            rslt,
            Err(Error::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                ..
            })
        );

        mocked_put.assert_async().await;
    }

    #[tokio::test]
    async fn download_object() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_get = server
            .mock("GET", "/datasets/iris.csv")
            .with_status(200)
            .with_body(b"sepal_length,sepal_width\n5.1,3.5\n")
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, None);
        let body = blobstore.download("datasets", "iris.csv").await.unwrap();
        assert_eq!(body.as_ref(), b"sepal_length,sepal_width\n5.1,3.5\n");

        mocked_get.assert_async().await;
    }

    #[tokio::test]
    async fn download_missing_object() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_get = server
            .mock("GET", "/datasets/absent.csv")
            .with_status(404)
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, None);
        let rslt = blobstore.download("datasets", "absent.csv").await;
        assert_matches!(rslt, Err(Error::NotFound { bucket, key }) => {
            assert_eq!(bucket, "datasets");
            assert_eq!(key, "absent.csv");
        });

        mocked_get.assert_async().await;
    }

    #[tokio::test]
    async fn download_to_file() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_get = server
            .mock("GET", "/datasets/iris.csv")
            .with_status(200)
            .with_body(b"a,b\n1,2\n")
            .create_async()
            .await;

        let tempdir = tempfile::tempdir().unwrap();
        let dest = tempdir.path().join("dataset.csv");
        let blobstore = blobstore_for(&server, None);
        blobstore
            .download_to_file("datasets", "iris.csv", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"a,b\n1,2\n");

        mocked_get.assert_async().await;
    }

    #[tokio::test]
    async fn delete_object() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_delete = server
            .mock("DELETE", "/models/model.bin")
            .with_status(204)
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, None);
        blobstore.delete("models", "model.bin").await.unwrap();

        mocked_delete.assert_async().await;
    }

    #[tokio::test]
    async fn delete_missing_object() {
        install_test_trace_subscriber();
        let mut server = mockito::Server::new_async().await;
        let mocked_delete = server
            .mock("DELETE", "/models/absent.bin")
            .with_status(404)
            .create_async()
            .await;

        let blobstore = blobstore_for(&server, None);
        let rslt = blobstore.delete("models", "absent.bin").await;
        assert_matches!(rslt, Err(Error::NotFound { .. }));

        mocked_delete.assert_async().await;
    }
}
