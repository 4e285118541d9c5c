//! InfluxDB 1.x writer.
//!
//! Points are sent as line protocol to the `/write` endpoint without a
//! timestamp, so the server stamps them at ingestion:
//! ```text
//! measurement field1=val1,field2=val2i
//! ```

use crate::ingest::CombinedRecord;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// A value stored in an InfluxDB field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    /// Written with an `i` suffix so the server stores it as an integer.
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}i"),
        }
    }
}

/// Renders one point. The caller guarantees at least one field.
pub fn encode_point(measurement: &str, fields: &[(&str, FieldValue)]) -> String {
    let mut line = escape_measurement(measurement);
    line.push(' ');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_field_key(key));
        line.push('=');
        line.push_str(&value.to_string());
    }
    line
}

pub fn encode_record(record: &CombinedRecord) -> String {
    encode_point(&record.measurement, &record.fields())
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_field_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("influx request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("influx rejected write with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Clone, Debug)]
pub struct InfluxSettings {
    pub url: String,
    pub database: String,
    pub retention_policy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// Long-lived writer; the inner client pools connections across writes.
#[derive(Clone)]
pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxWriter {
    pub fn new(settings: InfluxSettings) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        let write_url = write_url(
            &settings.url,
            &settings.database,
            settings.retention_policy.as_deref(),
        )?;
        Ok(Self {
            client,
            write_url,
            username: settings.username,
            password: settings.password,
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    pub async fn write_record(&self, record: &CombinedRecord) -> Result<(), WriteError> {
        let body = encode_record(record);
        let mut request = self.client.post(self.write_url.clone()).body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected {
            status,
            body: body.trim().to_string(),
        })
    }
}

fn write_url(base: &str, database: &str, retention_policy: Option<&str>) -> anyhow::Result<Url> {
    let mut url = Url::parse(base.trim())?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("influx url {base} cannot be a base"))?
        .pop_if_empty()
        .push("write");
    {
        let mut query = url.query_pairs_mut();
        query.clear().append_pair("db", database);
        if let Some(rp) = retention_policy {
            query.append_pair("rp", rp);
        }
    }
    Ok(url)
}
