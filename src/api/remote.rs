//! Purpose: Blocking HTTP client for the patient query service.
//! Exports: `RemoteClient`.
//! Role: Mirrors the local store operations against a running server.
//! Invariants: Error responses carry `{"detail": ...}`; status + detail map back
//! to the same `ErrorKind` the server started from.
//! Invariants: The base URL has no path; routes are rebuilt from segments.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::core::error::{Error, ErrorKind};
use crate::core::query::{
    INVALID_ORDER_MESSAGE, INVALID_SORT_FIELD_MESSAGE, NO_MATCH_MESSAGE, Query,
};
use crate::core::record::Record;
use crate::core::store::Store;
use crate::data_source;

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteClientInner>,
}

struct RemoteClientInner {
    base_url: Url,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct MessageEnvelope {
    message: String,
}

#[derive(Deserialize)]
struct DetailEnvelope {
    detail: Value,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().build();
        Ok(Self {
            inner: Arc::new(RemoteClientInner { base_url, agent }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn hello(&self) -> ApiResult<String> {
        let url = build_url(&self.inner.base_url, &[])?;
        let envelope: MessageEnvelope = self.get_json(&url)?;
        Ok(envelope.message)
    }

    pub fn about(&self) -> ApiResult<String> {
        let url = build_url(&self.inner.base_url, &["about"])?;
        let envelope: MessageEnvelope = self.get_json(&url)?;
        Ok(envelope.message)
    }

    pub fn view(&self) -> ApiResult<Store> {
        let url = build_url(&self.inner.base_url, &["view"])?;
        let body = self.get_text(&url)?;
        data_source::from_json_str(&body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid response json")
                .with_source(err)
        })
    }

    pub fn search(&self, patient_id: &str) -> ApiResult<Record> {
        let url = build_url(&self.inner.base_url, &["search", patient_id])?;
        self.get_json(&url)
    }

    pub fn query(&self, query: &Query) -> ApiResult<Vec<Record>> {
        let mut url = build_url(&self.inner.base_url, &["query"])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(name) = &query.name {
                pairs.append_pair("name", name);
            }
            if let Some(age) = query.age {
                pairs.append_pair("age", &age.to_string());
            }
            if let Some(city) = &query.city {
                pairs.append_pair("city", city);
            }
            if let Some(sort_by) = &query.sort_by {
                pairs.append_pair("sort_by", sort_by);
            }
            if let Some(order) = &query.order {
                pairs.append_pair("order", order);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        self.get_json(&url)
    }

    fn get_json<R>(&self, url: &Url) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let body = self.get_text(url)?;
        serde_json::from_str(&body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid response json")
                .with_source(err)
        })
    }

    fn get_text(&self, url: &Url) -> ApiResult<String> {
        let response = self
            .inner
            .agent
            .get(url.as_str())
            .set("Accept", "application/json")
            .call();
        match response {
            Ok(resp) => resp.into_string().map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read response body")
                    .with_source(err)
            }),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message("request failed")
                .with_source(err)),
        }
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("remote base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    let detail = serde_json::from_str::<DetailEnvelope>(&body)
        .ok()
        .map(|envelope| match envelope.detail {
            Value::String(text) => text,
            other => other.to_string(),
        });
    let kind = error_kind_from_response(status, detail.as_deref());
    let message = detail.unwrap_or_else(|| format!("remote error status {status}"));
    Error::new(kind).with_message(message)
}

fn error_kind_from_response(status: u16, detail: Option<&str>) -> ErrorKind {
    match (status, detail) {
        (404, Some(NO_MATCH_MESSAGE)) => ErrorKind::NoMatch,
        (404, _) => ErrorKind::NotFound,
        (400, Some(INVALID_SORT_FIELD_MESSAGE)) => ErrorKind::InvalidSortField,
        (400, Some(INVALID_ORDER_MESSAGE)) => ErrorKind::InvalidOrder,
        (400 | 422, _) => ErrorKind::Usage,
        (500..=599, _) => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
