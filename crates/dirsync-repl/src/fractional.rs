//! Fractional replication: per-class attribute filtering.
//!
//! A fractional replica keeps only a subset of attributes. The filter is
//! configured either exclusively (listed attributes are removed) or
//! inclusively (everything but the listed attributes is removed), per object
//! class, with `*` applying to every class. `objectclass` itself and
//! schema-mandatory attributes are never removed, and an attribute appearing
//! in the entry's RDN is narrowed to the RDN value rather than dropped.

use crate::error::ReplError;
use crate::providers::SchemaProvider;
use dirsync_types::{Modification, ModificationKind, Rdn};
use std::collections::{BTreeMap, BTreeSet};

/// Attributes a filter configuration may never name.
const PROHIBITED_ATTRS: [&str; 2] = ["objectclass", "2.5.4.0"];

/// Which way the configured attribute lists cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FractionalMode {
    /// No filtering configured.
    Disabled,
    /// Listed attributes are removed.
    Exclusive,
    /// Only listed attributes (and protected ones) are kept.
    Inclusive,
}

/// Outcome of filtering a Modify's modification list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModFilterOutcome {
    /// Nothing in the list was concerned.
    Untouched,
    /// Some modifications were removed, some remain.
    Filtered,
    /// Every modification was removed; the operation is now a no-op.
    BecomesNoOp,
}

/// Parsed fractional configuration for one domain.
#[derive(Debug, Clone)]
pub struct FractionalConfig {
    mode: FractionalMode,
    /// Attributes concerned for every class (the `*` entries).
    all_classes: BTreeSet<String>,
    /// Attributes concerned per specific class.
    per_class: BTreeMap<String, BTreeSet<String>>,
}

impl FractionalConfig {
    /// A configuration that filters nothing.
    pub fn disabled() -> Self {
        Self {
            mode: FractionalMode::Disabled,
            all_classes: BTreeSet::new(),
            per_class: BTreeMap::new(),
        }
    }

    /// Parses `class:attr1,attr2,...` directive lists. Exactly one of
    /// `exclude` and `include` may be non-empty.
    pub fn parse(exclude: &[String], include: &[String]) -> Result<Self, ReplError> {
        if !exclude.is_empty() && !include.is_empty() {
            return Err(ReplError::Config {
                msg: "fractional exclude and include are mutually exclusive".to_string(),
            });
        }
        let (mode, directives) = if !exclude.is_empty() {
            (FractionalMode::Exclusive, exclude)
        } else if !include.is_empty() {
            (FractionalMode::Inclusive, include)
        } else {
            return Ok(Self::disabled());
        };

        let mut all_classes = BTreeSet::new();
        let mut per_class: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for directive in directives {
            let (class, attrs) = directive.split_once(':').ok_or_else(|| ReplError::Config {
                msg: format!("malformed fractional directive: {directive}"),
            })?;
            let class = class.trim().to_ascii_lowercase();
            let mut parsed = BTreeSet::new();
            for attr in attrs.split(',') {
                let attr = attr.trim().to_ascii_lowercase();
                if attr.is_empty() {
                    return Err(ReplError::Config {
                        msg: format!("empty attribute in fractional directive: {directive}"),
                    });
                }
                if mode == FractionalMode::Exclusive
                    && PROHIBITED_ATTRS.contains(&attr.as_str())
                {
                    return Err(ReplError::Config {
                        msg: format!("fractional configuration may not remove {attr}"),
                    });
                }
                parsed.insert(attr);
            }
            if class == "*" {
                all_classes.extend(parsed);
            } else {
                per_class.entry(class).or_default().extend(parsed);
            }
        }
        Ok(Self {
            mode,
            all_classes,
            per_class,
        })
    }

    /// Whether any filtering is configured.
    pub fn is_enabled(&self) -> bool {
        self.mode != FractionalMode::Disabled
    }

    /// The configured mode.
    pub fn mode(&self) -> FractionalMode {
        self.mode
    }

    fn concerned(&self, object_classes: &BTreeSet<String>) -> BTreeSet<String> {
        let mut attrs = self.all_classes.clone();
        for class in object_classes {
            if let Some(class_attrs) = self.per_class.get(class) {
                attrs.extend(class_attrs.iter().cloned());
            }
        }
        attrs
    }

    /// Whether `attr` is removed for an entry of the given classes. Protected
    /// attributes are never removed regardless of mode.
    fn removes(&self, concerned: &BTreeSet<String>, attr: &str) -> bool {
        if PROHIBITED_ATTRS.contains(&attr) {
            return false;
        }
        match self.mode {
            FractionalMode::Disabled => false,
            FractionalMode::Exclusive => concerned.contains(attr),
            FractionalMode::Inclusive => !concerned.contains(attr),
        }
    }

    /// Filters an Add entry's attributes. When `apply` is false this only
    /// reports whether anything would change (the local-write rejection
    /// check). Returns true if at least one attribute was (or would be)
    /// removed or narrowed.
    pub fn filter_entry(
        &self,
        schema: &dyn SchemaProvider,
        object_classes: &BTreeSet<String>,
        rdn: Option<&Rdn>,
        attrs: &mut BTreeMap<String, Vec<String>>,
        apply: bool,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let concerned = self.concerned(object_classes);
        let mut touched = false;
        let mut narrowed: Vec<(String, Vec<String>)> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        for (attr, values) in attrs.iter() {
            if !self.removes(&concerned, attr) {
                continue;
            }
            if schema.is_mandatory(object_classes, attr) {
                continue;
            }
            if let Some(rdn_value) = rdn.and_then(|r| r.value_of(attr)) {
                // RDN attribute: keep only the naming value.
                let kept: Vec<String> = values
                    .iter()
                    .filter(|v| v.eq_ignore_ascii_case(rdn_value))
                    .cloned()
                    .collect();
                if kept.len() != values.len() {
                    touched = true;
                    narrowed.push((attr.clone(), kept));
                }
            } else {
                touched = true;
                removed.push(attr.clone());
            }
        }
        if apply {
            for (attr, kept) in narrowed {
                attrs.insert(attr, kept);
            }
            for attr in removed {
                attrs.remove(&attr);
            }
        }
        touched
    }

    /// Filters a Modify's modification list. When `apply` is false the list
    /// is left untouched and only the verdict is reported.
    pub fn filter_mods(
        &self,
        schema: &dyn SchemaProvider,
        object_classes: &BTreeSet<String>,
        mods: &mut Vec<Modification>,
        apply: bool,
    ) -> ModFilterOutcome {
        if !self.is_enabled() || mods.is_empty() {
            return ModFilterOutcome::Untouched;
        }
        let concerned = self.concerned(object_classes);
        let kept: Vec<Modification> = mods
            .iter()
            .filter(|m| {
                !self.removes(&concerned, &m.attr) || schema.is_mandatory(object_classes, &m.attr)
            })
            .cloned()
            .collect();
        let outcome = if kept.len() == mods.len() {
            ModFilterOutcome::Untouched
        } else if kept.is_empty() {
            ModFilterOutcome::BecomesNoOp
        } else {
            ModFilterOutcome::Filtered
        };
        if apply {
            *mods = kept;
        }
        outcome
    }

    /// Modifications cleaning up after a rename that kept its old RDN values.
    /// A filtered attribute was only retained because it named the entry;
    /// once the new RDN stops carrying a value it must be deleted.
    pub fn rename_cleanup(
        &self,
        schema: &dyn SchemaProvider,
        object_classes: &BTreeSet<String>,
        old_rdn: &Rdn,
        new_rdn: &Rdn,
    ) -> Vec<Modification> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let concerned = self.concerned(object_classes);
        let mut mods = Vec::new();
        for (attr, value) in old_rdn.avas() {
            if !self.removes(&concerned, attr) || schema.is_mandatory(object_classes, attr) {
                continue;
            }
            if new_rdn
                .value_of(attr)
                .is_some_and(|v| v.eq_ignore_ascii_case(value))
            {
                continue;
            }
            mods.push(Modification::new(
                ModificationKind::Delete,
                attr,
                vec![value.clone()],
            ));
        }
        mods
    }
}
