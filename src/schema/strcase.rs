//! Case conversion for enum-like values reported by the api server, e.g. `ContainersReady` becomes
//! `containers_ready`, so that the database holds consistent lower snake case values.

pub fn snake(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let next = chars.get(i + 1);
            let boundary = match prev {
                None => false,
                Some(p) if p == '_' || p == '-' || p == ' ' => false,
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                // end of an acronym like the `P` in `PodIPReady`
                Some(p) if p.is_uppercase() => next.map(|n| n.is_lowercase()).unwrap_or(false),
                Some(_) => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if *c == '-' || *c == ' ' {
            out.push('_');
        } else {
            out.push(*c);
        }
    }
    out
}
