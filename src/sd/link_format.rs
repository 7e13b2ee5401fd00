use log::debug;

use crate::endpoint::resource::{CoapResource, normalize_uri};

/// Parse a CoRE link-format document.
///
/// Links are split on commas; a piece that does not start with `<` belongs to
/// the previous link (a comma inside a quoted value) and is rejoined. Pieces
/// that still do not form a `<uri>` link are skipped.
pub fn parse_link_format(text: &str) -> Vec<CoapResource> {
    split_links(text)
        .iter()
        .filter_map(|link| {
            let parsed = parse_link(link);
            if parsed.is_none() {
                debug!(target: "Discovery", "Skipping malformed link '{}'", link);
            }
            parsed
        })
        .collect()
}

fn split_links(text: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for piece in text.split(',') {
        let trimmed = piece.trim();
        if trimmed.starts_with('<') {
            links.push(trimmed.to_string());
        } else if let Some(last) = links.last_mut() {
            last.push(',');
            last.push_str(piece);
        }
    }
    links
}

/// Split on `;` outside double quotes
fn split_attributes(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_link(link: &str) -> Option<CoapResource> {
    let rest = link.trim().strip_prefix('<')?;
    let end = rest.find('>')?;
    let mut resource = CoapResource::new(&rest[..end]);

    for attribute in split_attributes(&rest[end + 1..]) {
        let attribute = attribute.trim();
        if attribute.is_empty() {
            continue;
        }
        let (name, value) = match attribute.split_once('=') {
            Some((n, v)) => (n.trim(), Some(unquote(v))),
            None => (attribute, None),
        };
        apply_attribute(&mut resource, name, value);
    }
    Some(resource)
}

fn apply_attribute(resource: &mut CoapResource, name: &str, value: Option<&str>) {
    fn set(slot: &mut Option<String>, value: Option<&str>) {
        if slot.is_none() {
            *slot = value.map(str::to_string);
        }
    }
    fn set_int(slot: &mut Option<u32>, value: Option<&str>) {
        if slot.is_none() {
            *slot = value.and_then(|v| v.parse().ok());
        }
    }

    match name {
        "rt" => set(&mut resource.resource_type, value),
        "if" => set(&mut resource.interface_description, value),
        "sz" => set_int(&mut resource.maximum_size, value),
        "title" => set(&mut resource.title, value),
        "title*" => set(&mut resource.title_asterisk, value),
        "rel" => set(&mut resource.relation_type, value),
        "anchor" => set(&mut resource.anchor, value),
        "ct" => set_int(&mut resource.content_type, value),
        "ins" => set(&mut resource.instance, value),
        "key" => set(&mut resource.key, value),
        "obs" => resource.observable = true,
        _ => {}
    }
}

/// Serialize resources, in order, as link-format
pub fn to_link_format(resources: &[CoapResource]) -> String {
    resources.iter().map(format_link).collect::<Vec<_>>().join(",")
}

fn format_link(resource: &CoapResource) -> String {
    let mut out = format!("<{}>", normalize_uri(&resource.uri));
    let quoted = [
        ("rt", &resource.resource_type),
        ("if", &resource.interface_description),
    ];
    for (name, value) in quoted {
        if let Some(v) = value {
            out.push_str(&format!(";{}=\"{}\"", name, v));
        }
    }
    if let Some(sz) = resource.maximum_size {
        out.push_str(&format!(";sz={}", sz));
    }
    if let Some(title) = &resource.title {
        out.push_str(&format!(";title=\"{}\"", title));
    }
    if let Some(title) = &resource.title_asterisk {
        out.push_str(&format!(";title*={}", title));
    }
    let quoted = [
        ("rel", &resource.relation_type),
        ("anchor", &resource.anchor),
    ];
    for (name, value) in quoted {
        if let Some(v) = value {
            out.push_str(&format!(";{}=\"{}\"", name, v));
        }
    }
    if let Some(ct) = resource.content_type {
        out.push_str(&format!(";ct={}", ct));
    }
    let quoted = [("ins", &resource.instance), ("key", &resource.key)];
    for (name, value) in quoted {
        if let Some(v) = value {
            out.push_str(&format!(";{}=\"{}\"", name, v));
        }
    }
    if resource.observable {
        out.push_str(";obs");
    }
    out
}
