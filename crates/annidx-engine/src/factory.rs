use annidx_core::{Error, Result};

/// The index family named by a factory string, after stripping any
/// preprocessing stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKind {
    Flat,
    Ivf { nlists: usize },
    Hnsw { m: usize },
}

/// A parsed factory string: an optional PCAR preprocessor, whether `IDMap`
/// was requested (always honored -- every engine in this crate speaks
/// id-based add/search natively), and the terminal index kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorySpec {
    pub pcar_dim: Option<usize>,
    pub id_map: bool,
    pub index: IndexKind,
    pub raw: String,
}

/// Parses a comma-separated factory string such as `IDMap,Flat`,
/// `IVF256,Flat`, `PCAR64,IVF1,Flat`, or `HNSW32`.
///
/// Tokens are consumed left to right: `PCAR<d>` and `IDMap`/`IDMap2` are
/// preprocessing/wrapping stages and may appear in either order before the
/// terminal index token; `IVF<nlists>` must be immediately followed by its
/// base index token (only `Flat` is supported as an IVF base).
pub fn parse(factory_string: &str) -> Result<FactorySpec> {
    let tokens: Vec<&str> = factory_string.split(',').map(str::trim).collect();
    if tokens.is_empty() || tokens.iter().all(|t| t.is_empty()) {
        return Err(Error::InvalidConfig(
            "factory_string must not be empty.".to_string(),
        ));
    }

    let mut pcar_dim = None;
    let mut id_map = false;
    let mut index: Option<IndexKind> = None;
    let mut iter = tokens.into_iter().peekable();

    while let Some(tok) = iter.next() {
        if let Some(rest) = tok.strip_prefix("PCAR") {
            let d: usize = rest.parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid PCAR dimension in '{tok}'"))
            })?;
            pcar_dim = Some(d);
        } else if tok == "IDMap" || tok == "IDMap2" {
            id_map = true;
        } else if tok == "Flat" {
            if index.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "factory_string '{factory_string}' names more than one index"
                )));
            }
            index = Some(IndexKind::Flat);
        } else if let Some(rest) = tok.strip_prefix("IVF") {
            let nlists: usize = rest.parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid IVF cell count in '{tok}'"))
            })?;
            let base = iter.next().ok_or_else(|| {
                Error::InvalidConfig(format!("IVF token '{tok}' has no base index"))
            })?;
            if base != "Flat" {
                return Err(Error::InvalidConfig(format!(
                    "unsupported IVF base index '{base}'"
                )));
            }
            if index.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "factory_string '{factory_string}' names more than one index"
                )));
            }
            index = Some(IndexKind::Ivf { nlists });
        } else if let Some(rest) = tok.strip_prefix("HNSW") {
            let m: usize = rest
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("invalid HNSW degree in '{tok}'")))?;
            if index.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "factory_string '{factory_string}' names more than one index"
                )));
            }
            index = Some(IndexKind::Hnsw { m });
        } else {
            return Err(Error::InvalidConfig(format!(
                "unrecognized factory_string token '{tok}'"
            )));
        }
    }

    let index = index.ok_or_else(|| {
        Error::InvalidConfig(format!(
            "factory_string '{factory_string}' names no terminal index"
        ))
    })?;

    Ok(FactorySpec {
        pcar_dim,
        id_map,
        index,
        raw: factory_string.to_string(),
    })
}

impl FactorySpec {
    pub fn requires_training(&self) -> bool {
        self.pcar_dim.is_some() || matches!(self.index, IndexKind::Ivf { .. })
    }

    pub fn supports_remove(&self) -> bool {
        !matches!(self.index, IndexKind::Hnsw { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_idmap_flat() {
        let spec = parse("IDMap,Flat").unwrap();
        assert!(spec.id_map);
        assert_eq!(spec.index, IndexKind::Flat);
        assert!(spec.supports_remove());
    }

    #[test]
    fn parses_ivf_flat() {
        let spec = parse("IVF256,Flat").unwrap();
        assert_eq!(spec.index, IndexKind::Ivf { nlists: 256 });
        assert!(spec.requires_training());
    }

    #[test]
    fn parses_pcar_ivf_flat() {
        let spec = parse("PCAR64,IVF1,Flat").unwrap();
        assert_eq!(spec.pcar_dim, Some(64));
        assert_eq!(spec.index, IndexKind::Ivf { nlists: 1 });
    }

    #[test]
    fn parses_hnsw() {
        let spec = parse("HNSW32").unwrap();
        assert_eq!(spec.index, IndexKind::Hnsw { m: 32 });
        assert!(!spec.supports_remove());
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse("").is_err());
        assert!(parse("Bogus99").is_err());
        assert!(parse("IVF256").is_err());
    }

    proptest::proptest! {
        /// Any factory string this test assembles from valid tokens parses
        /// back into a `FactorySpec` naming the exact same stages, whatever
        /// order `PCAR`/`IDMap` were given in relative to the terminal index.
        #[test]
        fn parse_recovers_generated_tokens(
            pcar_dim in proptest::option::of(1usize..256usize),
            id_map in proptest::bool::ANY,
            kind in 0u8..3,
            nlists in 1usize..512usize,
            m in 1usize..64usize,
        ) {
            let mut tokens = Vec::new();
            if let Some(d) = pcar_dim {
                tokens.push(format!("PCAR{d}"));
            }
            if id_map {
                tokens.push("IDMap".to_string());
            }
            match kind {
                0 => tokens.push("Flat".to_string()),
                1 => {
                    tokens.push(format!("IVF{nlists}"));
                    tokens.push("Flat".to_string());
                }
                _ => tokens.push(format!("HNSW{m}")),
            }
            let factory_string = tokens.join(",");

            let spec = parse(&factory_string).unwrap();
            proptest::prop_assert_eq!(spec.pcar_dim, pcar_dim);
            proptest::prop_assert_eq!(spec.id_map, id_map);
            match kind {
                0 => proptest::prop_assert_eq!(spec.index, IndexKind::Flat),
                1 => proptest::prop_assert_eq!(spec.index, IndexKind::Ivf { nlists }),
                _ => proptest::prop_assert_eq!(spec.index, IndexKind::Hnsw { m }),
            }
        }
    }
}
