//! Per-build log writer.
//!
//! Lines go to the build's persisted log as they happen, so a running build's
//! progress can be read back at any time, and are mirrored to `tracing`.

use chrono::{SecondsFormat, Utc};
use tracing::{error, info};

use crate::store::{Store, StoreError};
use crate::types::{Build, BuildId};

/// Appends timestamped, build-tagged lines to one build's log.
#[derive(Clone)]
pub struct BuildLogger {
    store: Store,
    build_id: BuildId,
    label: String,
}

impl BuildLogger {
    pub fn new(store: Store, build: &Build) -> Self {
        BuildLogger {
            store,
            build_id: build.id,
            label: build.label(),
        }
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub async fn log(&self, message: impl AsRef<str>) -> Result<(), StoreError> {
        let message = message.as_ref();
        info!(build_id = %self.build_id, label = %self.label, "{}", message);
        self.store
            .append_log(self.build_id, self.format_line(message))
            .await
    }

    pub async fn error(&self, message: impl AsRef<str>) -> Result<(), StoreError> {
        let message = format!("ERROR: {}", message.as_ref());
        error!(build_id = %self.build_id, label = %self.label, "{}", message);
        self.store
            .append_log(self.build_id, self.format_line(&message))
            .await
    }

    fn format_line(&self, message: &str) -> String {
        format!(
            "[{}] [build:{}] [{}] {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.build_id,
            self.label,
            message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuildTrigger, NewBuild, NewRepository, PrNumber, Sha};

    async fn build(store: &Store, pr: Option<u64>) -> Build {
        let repo = store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        store
            .update(move |state| {
                Ok(state.insert_build(
                    NewBuild {
                        repo_id: repo.id,
                        trigger: BuildTrigger::Pr,
                        ref_name: "feature".to_string(),
                        commit_sha: Sha::new("abc123"),
                        pr_number: pr.map(PrNumber),
                    },
                    Utc::now(),
                ))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn lines_are_tagged_and_appended_in_order() {
        let store = Store::in_memory();
        let build = build(&store, Some(7)).await;
        let logger = BuildLogger::new(store.clone(), &build);

        logger.log("Install finished.").await.unwrap();
        logger.error("exit status 1").await.unwrap();

        let log = store.get_build(build.id).await.unwrap().unwrap().log;
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with(&format!("[build:{}] [pr:7] Install finished.", build.id)));
        assert!(lines[1].ends_with("[pr:7] ERROR: exit status 1"));
    }

    #[tokio::test]
    async fn branch_builds_use_ref_label() {
        let store = Store::in_memory();
        let build = build(&store, None).await;
        BuildLogger::new(store.clone(), &build).log("hi").await.unwrap();

        let log = store.get_build(build.id).await.unwrap().unwrap().log;
        assert!(log.contains("[ref:feature] hi"));
    }

    #[tokio::test]
    async fn unknown_build_is_an_error() {
        let store = Store::in_memory();
        let mut build = build(&store, None).await;
        build.id = BuildId(999);
        let err = BuildLogger::new(store, &build).log("lost").await.unwrap_err();
        assert!(matches!(err, StoreError::BuildNotFound(BuildId(999))));
    }
}
