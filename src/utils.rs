const KILO: f64 = 1024.0;
const MEGA: f64 = KILO * KILO;
const GIGA: f64 = KILO * KILO * KILO;

pub fn pretty_bytes_size(len: u64) -> String {
    let float_len = len as f64;
    let (unit, value) = if float_len > GIGA {
        ("GiB", float_len / GIGA)
    } else if float_len > MEGA {
        ("MiB", float_len / MEGA)
    } else if float_len > KILO {
        ("KiB", float_len / KILO)
    } else {
        ("bytes", float_len)
    };
    format!("{:.2}{}", value, unit)
}

/// Same as [`pretty_bytes_size`] for running totals that may dip below zero.
pub fn pretty_signed_bytes_size(len: i64) -> String {
    if len < 0 {
        format!("-{}", pretty_bytes_size(len.unsigned_abs()))
    } else {
        pretty_bytes_size(len as u64)
    }
}

fn primitive_name(descriptor: char) -> Option<&'static str> {
    let name = match descriptor {
        'Z' => "boolean",
        'B' => "byte",
        'C' => "char",
        'S' => "short",
        'I' => "int",
        'J' => "long",
        'F' => "float",
        'D' => "double",
        'V' => "void",
        _ => return None,
    };
    Some(name)
}

/// Converts JNI style class names (`Ljava/lang/String;`, `[[I`, `java/util/List`)
/// to their Java source form (`java.lang.String`, `int[][]`, `java.util.List`).
pub fn normalize_class_name(raw_class_name: &str) -> String {
    let dimensions = raw_class_name.chars().take_while(|c| *c == '[').count();
    let element = &raw_class_name[dimensions..];

    let mut element_name = if dimensions > 0 && element.chars().count() == 1 {
        element
            .chars()
            .next()
            .and_then(primitive_name)
            .map(str::to_string)
            .unwrap_or_else(|| element.to_string())
    } else if element.starts_with('L') && element.ends_with(';') && element.len() > 2 {
        element[1..element.len() - 1].to_string()
    } else {
        element.to_string()
    };
    element_name = element_name.replace('/', ".");

    for _ in 0..dimensions {
        element_name.push_str("[]");
    }
    element_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_pretty_bytes() {
        assert_eq!(pretty_bytes_size(1048), "1.02KiB");
        assert_eq!(pretty_bytes_size(1048576), "1024.00KiB");
        assert_eq!(pretty_bytes_size(1049999), "1.00MiB");
        assert_eq!(pretty_bytes_size(1073741824), "1024.00MiB");
        assert_eq!(pretty_bytes_size(1073741825), "1.00GiB");
        assert_eq!(pretty_bytes_size(12), "12.00bytes");
    }

    #[test]
    fn signed_size_keeps_sign() {
        assert_eq!(pretty_signed_bytes_size(-12), "-12.00bytes");
        assert_eq!(pretty_signed_bytes_size(0), "0.00bytes");
    }

    #[test]
    fn class_names_from_jni() {
        assert_eq!(normalize_class_name("Ljava/lang/String;"), "java.lang.String");
        assert_eq!(normalize_class_name("[Ljava/lang/String;"), "java.lang.String[]");
        assert_eq!(normalize_class_name("[[I"), "int[][]");
        assert_eq!(normalize_class_name("[B"), "byte[]");
        assert_eq!(normalize_class_name("java/util/List"), "java.util.List");
        assert_eq!(normalize_class_name("com.foo.Bar"), "com.foo.Bar");
    }
}
