const UNITS: [(char, u64); 4] = [
    ('T', 1 << 40),
    ('G', 1 << 30),
    ('M', 1 << 20),
    ('K', 1 << 10),
];

/// Render a byte count the way `zfs set` accepts it: the largest binary unit
/// that divides it exactly, plain bytes otherwise, `none` when unset.
pub fn size_prefixed(size: Option<u64>) -> String {
    let Some(size) = size else {
        return "none".to_string();
    };
    for (prefix, unit) in UNITS {
        if size >= unit && size % unit == 0 {
            return format!("{}{}", size / unit, prefix);
        }
    }
    size.to_string()
}
