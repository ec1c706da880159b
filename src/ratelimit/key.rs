//! Counter key generation and method classification.

/// Groups HTTP methods that share a window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodClass {
    /// POST, PUT, PATCH and DELETE
    Mutating,
    /// GET and everything else
    Read,
}

impl MethodClass {
    /// Classify an HTTP method name, ignoring case.
    pub fn of(method: &str) -> Self {
        match normalize_method(method).as_str() {
            "POST" | "PUT" | "PATCH" | "DELETE" => MethodClass::Mutating,
            _ => MethodClass::Read,
        }
    }
}

/// A key that uniquely identifies a (client, method) counter.
///
/// The client identifier is trimmed and the method upper-cased, so the same
/// pair always yields the same key regardless of how it was spelled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    client: String,
    method: String,
}

impl CounterKey {
    /// Create a new counter key from a client identifier and method.
    pub fn new(client_id: &str, method: &str) -> Self {
        Self {
            client: client_id.trim().to_string(),
            method: normalize_method(method),
        }
    }

    /// The client part of the key.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// The normalized method part of the key.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Key used in the local counter map.
    pub fn to_local_key(&self) -> String {
        format!("{}:{}", self.client, self.method)
    }

    /// Key used in the shared backend, namespaced by `prefix`.
    pub fn to_shared_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.to_local_key())
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_local_key())
    }
}

fn normalize_method(method: &str) -> String {
    method.trim().to_ascii_uppercase()
}
