use std::fmt;
use std::str::FromStr;

use serde::{de::Visitor, Deserialize, Serialize};

use crate::error::ConfigError;

/// Supported HTTP methods for a probe.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HttpMethod {
    GET,
    HEAD,
    POST,
}

impl FromStr for HttpMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "GET" => Ok(HttpMethod::GET),
            "HEAD" => Ok(HttpMethod::HEAD),
            "POST" => Ok(HttpMethod::POST),
            invalid => Err(ConfigError::InvalidMethod(invalid.to_owned())),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HttpMethod::GET => write!(f, "GET"),
            HttpMethod::HEAD => write!(f, "HEAD"),
            HttpMethod::POST => write!(f, "POST"),
        }
    }
}

struct HttpMethodVisitor;

impl<'de> Visitor<'de> for HttpMethodVisitor {
    type Value = HttpMethod;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "one of GET, HEAD, POST")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        HttpMethod::from_str(s).map_err(|_| serde::de::Error::invalid_value(
            serde::de::Unexpected::Str(s),
            &self,
        ))
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(HttpMethodVisitor)
    }
}

impl Serialize for HttpMethod {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(val: HttpMethod) -> Self {
        match val {
            HttpMethod::GET => reqwest::Method::GET,
            HttpMethod::HEAD => reqwest::Method::HEAD,
            HttpMethod::POST => reqwest::Method::POST,
        }
    }
}

impl From<&HttpMethod> for reqwest::Method {
    fn from(val: &HttpMethod) -> Self {
        (*val).into()
    }
}
