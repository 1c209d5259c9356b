use anyhow::{Result, bail};

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate a tracked resource name as it appears in a quota's `hard` map:
/// dotted lowercase segments (`requests.cpu`, `services.nodeports`) with at
/// most one `/` separating a class prefix from the resource
/// (`fast-ssd.storageclass.storage.k8s.io/requests.storage`).
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("resource name must not be empty");
    }
    if name.len() > 253 {
        bail!("resource name '{}' exceeds 253 characters", name);
    }
    let mut parts = name.split('/');
    let (first, second) = (parts.next(), parts.next());
    if parts.next().is_some() {
        bail!("resource name '{}' has more than one '/'", name);
    }
    for part in [first, second].into_iter().flatten() {
        if part.is_empty() {
            bail!("resource name '{}' has an empty segment", name);
        }
        if part.starts_with('.') || part.ends_with('.') {
            bail!("resource name '{}' must not start or end with a dot", name);
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            bail!(
                "resource name '{}' must contain only lowercase letters, digits, hyphens, and dots",
                name
            );
        }
    }
    Ok(())
}
