//! S3 relay objects.

use camino::Utf8Path;

use super::{AwsBackend, svc};
use crate::backend::{BackendError, BackendFuture, RelayLocation, RelayStore};
use crate::command::CommandRunner;

impl<R: CommandRunner> RelayStore for AwsBackend<R> {
    fn location(&self, key: &str) -> Result<RelayLocation, BackendError> {
        let bucket = self.relay_bucket.clone().ok_or_else(|| BackendError::Config {
            message: String::from(
                "no relay bucket configured; set GANGWAY_RELAY_BUCKET or relay_bucket in gangway.toml",
            ),
        })?;
        Ok(RelayLocation {
            bucket,
            key: key.to_owned(),
        })
    }

    fn put<'a>(
        &'a self,
        region: &'a str,
        local: &'a Utf8Path,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut args = svc(&["s3", "cp"]);
            args.extend([local.to_string(), location.uri(), String::from("--only-show-errors")]);
            self.call(region, "relay upload", args).await.map(|_out| ())
        })
    }

    fn get<'a>(
        &'a self,
        region: &'a str,
        location: &'a RelayLocation,
        local: &'a Utf8Path,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut args = svc(&["s3", "cp"]);
            args.extend([location.uri(), local.to_string(), String::from("--only-show-errors")]);
            self.call(region, "relay download", args).await.map(|_out| ())
        })
    }

    fn delete<'a>(
        &'a self,
        region: &'a str,
        location: &'a RelayLocation,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut args = svc(&["s3api", "delete-object", "--bucket"]);
            args.extend([location.bucket.clone(), String::from("--key"), location.key.clone()]);
            match self.call(region, "relay object", args).await {
                Ok(_) | Err(BackendError::NotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }
}
