use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Configs use the shorthand `":PORT"` to mean "bind on all interfaces",
/// which `SocketAddr` parsing does not accept, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Appends `default_port` to an upstream address that has none.
pub fn with_default_port(addr: &str, default_port: u16) -> Cow<'_, str> {
    let s = addr.trim();
    if s.is_empty() {
        return Cow::Borrowed(s);
    }
    if let Some(pos) = s.rfind(']') {
        if s[pos + 1..].contains(':') {
            return Cow::Borrowed(s);
        }
        return Cow::Owned(format!("{s}:{default_port}"));
    }
    match s.matches(':').count() {
        0 => Cow::Owned(format!("{s}:{default_port}")),
        1 => Cow::Borrowed(s),
        // Bare IPv6 literal.
        _ => Cow::Owned(format!("[{s}]:{default_port}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25565").as_ref(), "0.0.0.0:25565");
        assert_eq!(normalize_bind_addr(" :19132 ").as_ref(), "0.0.0.0:19132");
        assert_eq!(normalize_bind_addr("[::]:25565").as_ref(), "[::]:25565");
    }

    #[test]
    fn default_port_only_when_missing() {
        assert_eq!(with_default_port("mc.example.com", 25565), "mc.example.com:25565");
        assert_eq!(with_default_port("10.0.0.1:25570", 25565), "10.0.0.1:25570");
        assert_eq!(with_default_port("[::1]", 19132), "[::1]:19132");
        assert_eq!(with_default_port("[::1]:1", 19132), "[::1]:1");
        assert_eq!(with_default_port("::1", 19132), "[::1]:19132");
    }
}
