//! Small `FromStr` wrapper types shared by every binary's `envconfig::Envconfig`
//! struct: millisecond durations, non-empty strings, the task allow-list, and the
//! development URL-override map this runtime's dispatch contract needs.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// The allow-list of task identifiers a Worker will accept, read from `SUPPORTED_TASKS`.
/// `*` means "support any task" (`SUPPORT_ANY` is equivalent and takes precedence).
#[derive(Debug, Clone)]
pub enum TaskAllowList {
    Any,
    Named(Vec<String>),
}

impl TaskAllowList {
    pub fn names(&self) -> Option<&[String]> {
        match self {
            TaskAllowList::Any => None,
            TaskAllowList::Named(names) => Some(names),
        }
    }

    pub fn supports(&self, task_identifier: &str) -> bool {
        match self {
            TaskAllowList::Any => true,
            TaskAllowList::Named(names) => names.iter().any(|n| n == task_identifier),
        }
    }
}

impl FromStr for TaskAllowList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "*" {
            Ok(TaskAllowList::Any)
        } else {
            Ok(TaskAllowList::Named(
                s.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_owned).collect(),
            ))
        }
    }
}

/// The per-task URL override map read from `DEV_TASK_URL_MAP`, formatted as
/// `task=url,task2=url2`. Active outside production to bypass the gateway.
#[derive(Debug, Clone, Default)]
pub struct DevTaskUrlMap(pub HashMap<String, Url>);

#[derive(Debug, thiserror::Error)]
pub enum ParseDevTaskUrlMapError {
    #[error("malformed dev task url map entry: {0}")]
    MalformedEntry(String),
    #[error("invalid url for task {task}: {source}")]
    InvalidUrl {
        task: String,
        #[source]
        source: url::ParseError,
    },
}

impl FromStr for DevTaskUrlMap {
    type Err = ParseDevTaskUrlMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = HashMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (task, url) = entry
                .split_once('=')
                .ok_or_else(|| ParseDevTaskUrlMapError::MalformedEntry(entry.to_owned()))?;
            let url = Url::parse(url).map_err(|source| ParseDevTaskUrlMapError::InvalidUrl {
                task: task.to_owned(),
                source,
            })?;
            map.insert(task.to_owned(), url);
        }
        Ok(DevTaskUrlMap(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_allow_list_parses_star_as_any() {
        assert!(matches!("*".parse::<TaskAllowList>().unwrap(), TaskAllowList::Any));
    }

    #[test]
    fn task_allow_list_parses_comma_separated_names() {
        let list: TaskAllowList = "simple-email, send-sms".parse().unwrap();
        assert!(list.supports("simple-email"));
        assert!(list.supports("send-sms"));
        assert!(!list.supports("unknown-task"));
    }

    #[test]
    fn dev_task_url_map_parses_multiple_entries() {
        let map: DevTaskUrlMap = "simple-email=http://localhost:9001/email,send-sms=http://localhost:9002/sms"
            .parse()
            .unwrap();
        assert_eq!(map.0.len(), 2);
        assert_eq!(map.0["simple-email"].as_str(), "http://localhost:9001/email");
    }

    #[test]
    fn dev_task_url_map_rejects_malformed_entries() {
        assert!("simple-email".parse::<DevTaskUrlMap>().is_err());
    }
}
