//! Failure diagnostics for scenario debugging
//!
//! Collected before teardown when a scenario fails, while the share's pods
//! and events still exist.

use crate::cluster::ClusterApi;
use crate::events::InvolvedObject;
use crate::locator::LabelSelector;
use k8s_openapi::api::core::v1::Event;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

const LINE_WIDTH: usize = 80;
const HEAVY_LINE: &str = "━";
const LIGHT_LINE: &str = "─";
const MAX_LOG_LINES: usize = 50;
const MAX_MESSAGE_LEN: usize = 45;

/// Collected diagnostic information from a failed scenario
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Scenario name, when known
    pub scenario: Option<String>,
    /// Namespace the scenario ran in
    pub namespace: String,
    /// Selector the share's pods were located with
    pub selector: Option<String>,
    /// Pod name -> logs
    pub pod_logs: BTreeMap<String, String>,
    /// Events for the share and its pods
    pub events: Vec<Event>,
}

impl Diagnostics {
    /// Create new empty diagnostics for a namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Label this report with a scenario name
    pub fn for_scenario(mut self, name: impl Into<String>) -> Self {
        self.scenario = Some(name.into());
        self
    }

    /// Gather logs of every pod matching `selector` plus events for
    /// `involved` and those pods
    ///
    /// Collection is best effort: a failed query leaves its part empty.
    pub async fn collect(
        cluster: &dyn ClusterApi,
        namespace: &str,
        selector: &LabelSelector,
        involved: &[InvolvedObject],
    ) -> Self {
        let mut diag = Self::new(namespace);
        diag.selector = Some(selector.to_string());

        let pods = match cluster.list_pods(namespace, selector).await {
            Ok(pods) => pods,
            Err(e) => {
                debug!(namespace = %namespace, error = %e, "Could not list pods for diagnostics");
                Vec::new()
            }
        };

        let mut targets: Vec<InvolvedObject> = involved.to_vec();
        for pod in &pods {
            let name = pod.name_any();
            match cluster.pod_logs(namespace, &name).await {
                Ok(logs) => {
                    diag.pod_logs.insert(name.clone(), logs);
                }
                Err(e) => {
                    debug!(pod = %name, error = %e, "Could not fetch logs for diagnostics");
                }
            }
            targets.push(InvolvedObject::new("Pod", name));
        }

        for target in &targets {
            match cluster.list_events(namespace, target).await {
                Ok(events) => diag.events.extend(events),
                Err(e) => {
                    debug!(object = %target, error = %e, "Could not list events for diagnostics");
                }
            }
        }

        diag
    }

    fn heavy_line() -> String {
        HEAVY_LINE.repeat(LINE_WIDTH)
    }

    fn section_header(title: &str) -> String {
        let title_with_spaces = format!(" {} ", title);
        let remaining = LINE_WIDTH.saturating_sub(title_with_spaces.chars().count() + 3);
        format!(
            "{}{}{}",
            LIGHT_LINE.repeat(3),
            title_with_spaces,
            LIGHT_LINE.repeat(remaining)
        )
    }
}

fn truncate(message: &str, max: usize) -> String {
    if message.chars().count() > max {
        format!("{}...", message.chars().take(max).collect::<String>())
    } else {
        message.to_string()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", Self::heavy_line())?;
        match &self.scenario {
            Some(name) => writeln!(f, "  SCENARIO FAILED: {name}")?,
            None => writeln!(f, "  SCENARIO FAILED")?,
        }
        writeln!(f, "{}", Self::heavy_line())?;
        writeln!(f)?;
        writeln!(f, "  Namespace: {}", self.namespace)?;
        if let Some(selector) = &self.selector {
            writeln!(f, "  Selector:  {selector}")?;
        }

        if !self.pod_logs.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", Self::section_header("Pod Logs"))?;

            for (pod_name, logs) in &self.pod_logs {
                writeln!(f)?;
                writeln!(f, "[{}]", pod_name)?;

                if logs.is_empty() {
                    writeln!(f, "  (no logs)")?;
                } else {
                    let lines: Vec<&str> = logs.lines().collect();
                    // Show the tail; startup noise is rarely the problem.
                    let skip = lines.len().saturating_sub(MAX_LOG_LINES);
                    if skip > 0 {
                        writeln!(f, "  ... ({} earlier lines)", skip)?;
                    }
                    for line in lines.iter().skip(skip) {
                        writeln!(f, "  {}", line)?;
                    }
                }
            }
        }

        if !self.events.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{}",
                Self::section_header(&format!("Events ({})", self.events.len()))
            )?;
            writeln!(f)?;

            // Events without timestamps sort last
            let mut events: Vec<_> = self.events.iter().collect();
            events.sort_by_key(|event| {
                event
                    .last_timestamp
                    .as_ref()
                    .map(|t| t.0)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            });

            for event in events {
                let timestamp = event
                    .last_timestamp
                    .as_ref()
                    .map(|t| t.0.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "??:??:??".to_string());

                let kind = event.involved_object.kind.as_deref().unwrap_or("?");
                let name = event.involved_object.name.as_deref().unwrap_or("?");
                let reason = event.reason.as_deref().unwrap_or("Unknown");
                let message = event.message.as_deref().unwrap_or("");

                writeln!(
                    f,
                    "  • {}  {:20}  {:28}  {}",
                    timestamp,
                    format!("{}/{}", kind, name),
                    reason,
                    truncate(message, MAX_MESSAGE_LEN)
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{}", Self::section_header("Debug"))?;
        writeln!(f)?;
        writeln!(f, "  kubectl -n {} get smbshares,pods,svc,pvc", self.namespace)?;
        match &self.selector {
            Some(selector) => {
                writeln!(f, "  kubectl -n {} describe pods -l {}", self.namespace, selector)?;
                writeln!(f, "  kubectl -n {} logs -l {}", self.namespace, selector)?;
            }
            None => writeln!(f, "  kubectl -n {} describe pods", self.namespace)?,
        }
        writeln!(f, "  kubectl -n {} get events --sort-by=.lastTimestamp", self.namespace)?;
        writeln!(f)?;
        writeln!(f, "{}", Self::heavy_line())?;

        Ok(())
    }
}
