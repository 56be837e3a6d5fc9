use std::{
    collections::{BTreeSet, HashMap},
    io::Read,
    path::Path,
};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use super::expression::Predicate;
use crate::geofile::feature::{Feature, FeatureMap};

/// Attributes needed regardless of the rules, e.g. for chain detection.
pub const ALWAYS_NEEDED_KEYS: [&str; 4] = ["name", "operator", "brand", "origin"];

/// Position of a POI in the category hierarchy, from finest (A) to coarsest (C).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CategoryPath {
    pub class_a: String,
    pub class_b: String,
    pub class_c: String,
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Row order in the scheme, lower sequence wins.
    pub sequence: usize,
    pub predicate: Predicate,
    pub class_a: String,
}

/// One row of the classification scheme table.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemeRow {
    #[serde(rename = "Active")]
    pub active: String,
    #[serde(rename = "Class_A")]
    pub class_a: String,
    #[serde(rename = "Class_B")]
    pub class_b: String,
    #[serde(rename = "Class_C")]
    pub class_c: String,
    #[serde(rename = "Filter")]
    pub filter: String,
}

/// Ordered rules plus the Class_A -> (Class_B, Class_C) lookup derived from the active rows.
#[derive(Debug, Clone)]
pub struct ClassificationScheme {
    rules: Vec<ClassificationRule>,
    lookup: HashMap<String, CategoryPath>,
}

impl ClassificationScheme {
    pub fn from_csv_path(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Opening classification scheme {:?}", path))?;
        Self::from_reader(file).with_context(|| format!("Reading classification scheme {:?}", path))
    }

    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let rows: Vec<SchemeRow> = csv::Reader::from_reader(reader)
            .deserialize()
            .collect::<Result<_, _>>()?;
        Self::from_rows(rows)
    }

    /// Build the scheme from table rows in order. Inactive rows are skipped entirely. Every
    /// active filter must parse and every Class_A must map to a single (Class_B, Class_C).
    pub fn from_rows(rows: impl IntoIterator<Item = SchemeRow>) -> anyhow::Result<Self> {
        let mut rules = Vec::new();
        let mut lookup: HashMap<String, CategoryPath> = HashMap::new();
        for (row_index, row) in rows.into_iter().enumerate() {
            let row_number = row_index + 1;
            if !parse_active(&row.active)
                .with_context(|| format!("Invalid Active value in scheme row {}", row_number))?
            {
                continue;
            }
            let class_a = row.class_a.trim().to_string();
            if class_a.is_empty() {
                bail!("Scheme row {} has an empty Class_A", row_number);
            }
            let predicate: Predicate = row.filter.parse().with_context(|| {
                format!(
                    "Invalid filter in scheme row {} ({}): {}",
                    row_number, class_a, row.filter
                )
            })?;
            let path = CategoryPath {
                class_a: class_a.clone(),
                class_b: row.class_b.trim().to_string(),
                class_c: row.class_c.trim().to_string(),
            };
            match lookup.get(&class_a) {
                Some(existing) if *existing != path => {
                    bail!(
                        "Class_A '{}' maps to both ({}, {}) and ({}, {}), see scheme row {}",
                        class_a,
                        existing.class_b,
                        existing.class_c,
                        path.class_b,
                        path.class_c,
                        row_number
                    );
                }
                Some(_) => {}
                None => {
                    lookup.insert(class_a.clone(), path);
                }
            }
            rules.push(ClassificationRule {
                sequence: rules.len(),
                predicate,
                class_a,
            });
        }
        log::info!(
            "Loaded {} active classification rules for {} categories",
            rules.len(),
            lookup.len()
        );
        Ok(Self { rules, lookup })
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// The first rule, in sequence order, whose predicate holds.
    pub fn matching_rule(&self, attributes: &FeatureMap) -> Option<&ClassificationRule> {
        self.rules
            .iter()
            .find(|rule| rule.predicate.evaluate(attributes))
    }

    pub fn classify(&self, attributes: &FeatureMap) -> Option<CategoryPath> {
        self.matching_rule(attributes)
            .and_then(|rule| self.category_path(&rule.class_a))
    }

    pub fn category_path(&self, class_a: &str) -> Option<CategoryPath> {
        self.lookup.get(class_a).cloned()
    }

    /// Keys referenced by any active filter plus `ALWAYS_NEEDED_KEYS`.
    pub fn attribute_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = ALWAYS_NEEDED_KEYS
            .iter()
            .map(|key| key.to_string())
            .collect();
        for rule in &self.rules {
            keys.extend(rule.predicate.keys());
        }
        keys
    }

    pub fn class_c_categories(&self) -> BTreeSet<String> {
        self.lookup
            .values()
            .map(|path| path.class_c.clone())
            .collect()
    }
}

fn parse_active(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "0" | "" => Ok(false),
        other => Err(anyhow!("'{}' is not a boolean", other)),
    }
}

/// Assign a category to every feature and keep only those that matched a rule.
pub fn classify_features(scheme: &ClassificationScheme, features: Vec<Feature>) -> Vec<Feature> {
    let num_features = features.len();
    let pois: Vec<Feature> = features
        .into_iter()
        .filter_map(|mut feature| {
            feature.category = scheme.classify(&feature.attributes);
            feature.category.is_some().then_some(feature)
        })
        .collect();
    log::info!(
        "Classified {} out of {} features as POIs",
        pois.len(),
        num_features
    );
    pois
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use rstest::{fixture, rstest};
    use testdir::testdir;

    use super::{classify_features, ClassificationScheme, SchemeRow};
    use crate::geofile::feature::{Feature, FeatureMap};

    pub(crate) const TEST_SCHEME: &str = r#"Active,Class_A,Class_B,Class_C,Filter
TRUE,Cafe,Cafes,Food,amenity == 'cafe'
TRUE,Bakery,Bakeries,Food,shop == 'bakery'
TRUE,Supermarket,Supermarkets,Food,shop in ['supermarket']
TRUE,Food Store,Other Food Stores,Food,"shop in ['convenience', 'deli']"
FALSE,Nightclub,Nightlife,Leisure,amenity == 'nightclub' and this is not a valid filter
TRUE,Pharmacy,Pharmacies,Health,amenity == 'pharmacy' or healthcare == 'pharmacy'
TRUE,Doctor,Doctors,Health,amenity == 'doctors'
"#;

    #[fixture]
    pub(crate) fn scheme() -> ClassificationScheme {
        ClassificationScheme::from_rows(vec![
            row("TRUE", "Cafe", "Cafes", "Food", "amenity == 'cafe'"),
            row("TRUE", "Bakery", "Bakeries", "Food", "shop == 'bakery'"),
            row("TRUE", "Supermarket", "Supermarkets", "Food", "shop in ['supermarket']"),
            row(
                "TRUE",
                "Food Store",
                "Other Food Stores",
                "Food",
                "shop in ['convenience', 'deli']",
            ),
            row(
                "FALSE",
                "Nightclub",
                "Nightlife",
                "Leisure",
                "amenity == 'nightclub' and this is not a valid filter",
            ),
            row(
                "TRUE",
                "Pharmacy",
                "Pharmacies",
                "Health",
                "amenity == 'pharmacy' or healthcare == 'pharmacy'",
            ),
            row("TRUE", "Doctor", "Doctors", "Health", "amenity == 'doctors'"),
        ])
        .unwrap()
    }

    pub(crate) fn row(active: &str, a: &str, b: &str, c: &str, filter: &str) -> SchemeRow {
        SchemeRow {
            active: active.to_string(),
            class_a: a.to_string(),
            class_b: b.to_string(),
            class_c: c.to_string(),
            filter: filter.to_string(),
        }
    }

    fn attributes(pairs: &[(&str, &str)]) -> FeatureMap {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<String, String>>()
    }

    #[rstest]
    fn test_first_matching_rule_wins(scheme: ClassificationScheme) {
        // Tagged as both, the earlier Cafe rule takes precedence over Bakery.
        let both = attributes(&[("shop", "bakery"), ("amenity", "cafe")]);
        let rule = scheme.matching_rule(&both).unwrap();
        assert_eq!(rule.class_a, "Cafe");
        assert_eq!(rule.sequence, 0);

        let bakery = attributes(&[("shop", "bakery")]);
        assert_eq!(scheme.classify(&bakery).unwrap().class_a, "Bakery");
    }

    #[rstest]
    fn test_precedence_is_independent_of_attribute_order(scheme: ClassificationScheme) {
        for _ in 0..20 {
            // HashMap iteration order differs between instances.
            let mut attributes = HashMap::new();
            attributes.insert("amenity".to_string(), "cafe".to_string());
            attributes.insert("shop".to_string(), "bakery".to_string());
            assert_eq!(scheme.classify(&attributes).unwrap().class_a, "Cafe");
        }
    }

    #[rstest]
    fn test_classify_category_path(scheme: ClassificationScheme) {
        let path = scheme
            .classify(&attributes(&[("healthcare", "pharmacy")]))
            .unwrap();
        assert_eq!(path.class_a, "Pharmacy");
        assert_eq!(path.class_b, "Pharmacies");
        assert_eq!(path.class_c, "Health");
        assert!(scheme.classify(&attributes(&[("amenity", "bench")])).is_none());
        assert!(scheme
            .classify(&attributes(&[("amenity", "nightclub")]))
            .is_none());
    }

    #[rstest]
    fn test_classification_is_idempotent(scheme: ClassificationScheme) {
        let features: Vec<Feature> = [
            &[("amenity", "cafe")][..],
            &[("shop", "bakery"), ("amenity", "cafe")][..],
            &[("amenity", "doctors")][..],
            &[("amenity", "bench")][..],
        ]
        .iter()
        .enumerate()
        .map(|(index, pairs)| {
            Feature::new(
                index.to_string(),
                geo::Point::new(0.0, 0.0).into(),
                attributes(pairs),
            )
        })
        .collect();

        let first = classify_features(&scheme, features.clone());
        let second = classify_features(&scheme, first.clone());
        assert_eq!(first.len(), 3);
        let labels = |features: &Vec<Feature>| {
            features
                .iter()
                .map(|feature| (feature.id.clone(), feature.category.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(labels(&first), labels(&second));
    }

    #[rstest]
    fn test_attribute_keys(scheme: ClassificationScheme) {
        let keys: Vec<String> = scheme.attribute_keys().into_iter().collect();
        assert_eq!(
            keys,
            vec!["amenity", "brand", "healthcare", "name", "operator", "origin", "shop"]
        );
        let categories: Vec<String> = scheme.class_c_categories().into_iter().collect();
        assert_eq!(categories, vec!["Food", "Health"]);
    }

    #[test]
    fn test_malformed_active_filter_fails() {
        let result = ClassificationScheme::from_rows(vec![row(
            "TRUE",
            "Cafe",
            "Cafes",
            "Food",
            "amenity === 'cafe'",
        )]);
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("scheme row 1"), "{}", message);
    }

    #[test]
    fn test_inconsistent_lookup_fails() {
        let result = ClassificationScheme::from_rows(vec![
            row("TRUE", "Cafe", "Cafes", "Food", "amenity == 'cafe'"),
            row("TRUE", "Cafe", "Bars", "Leisure", "cuisine == 'coffee_shop'"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_csv_path() {
        let path = testdir!().join("scheme.csv");
        std::fs::write(&path, TEST_SCHEME).unwrap();
        let scheme = ClassificationScheme::from_csv_path(&path).unwrap();
        assert_eq!(scheme.rules().len(), 6);
        assert_eq!(
            scheme.category_path("Food Store").unwrap().class_b,
            "Other Food Stores"
        );
        assert_eq!(
            scheme
                .classify(&attributes(&[("shop", "deli")]))
                .unwrap()
                .class_a,
            "Food Store"
        );
    }
}
