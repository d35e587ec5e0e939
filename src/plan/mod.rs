//! Plan node model
//!
//! The closed set of plan operators. A plan is an immutable tree built
//! by the planner; its stable external form is JSON, one object per
//! node with the `#operator` discriminator first. Deserialization
//! dispatches through the registry; unknown discriminators are decode
//! errors. `verify` checks a plan against the live catalog before a
//! prepared plan is reused.

pub mod control;
pub mod dml;
pub mod errors;
pub mod estimate;
pub mod join;
pub mod query;
pub mod registry;
pub mod scan;
pub mod setop;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::datastore::{Catalog, Keyspace};

pub use control::{Authorize, Collect, CreateFunction, Discard, Parallel, Prepare, Sequence, Stream};
pub use dml::{Clone, Merge, SendDelete, SendInsert, SendUpdate, Set, SetTermDef, Unset, Upsert};
pub use errors::PlanError;
pub use estimate::{OptEstimate, CARD_NOT_AVAIL, COST_NOT_AVAIL, SIZE_NOT_AVAIL};
pub use join::{HashJoin, Join, NLJoin};
pub use query::{
    AggregateDef, Distinct, Filter, FinalGroup, FinalProject, InitialGroup, InitialProject,
    IntermediateGroup, Limit, Offset, Order, OrderDef, ProjectionDef,
};
pub use scan::{
    Fetch, IndexScan, IntersectScan, KeyScan, OrderedIntersectScan, PrimaryScan, UnionScan,
    ValueScan, ValuesPair, MAX_SCAN_FANIN,
};
pub use setop::{ExceptAll, IntersectAll, UnionAll};

/// A keyspace reference inside a plan: name, statement alias, and the
/// structural fingerprint recorded at build time.
#[derive(Debug, std::clone::Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceTerm {
    pub keyspace: String,
    pub alias: String,
    pub fingerprint: Uuid,
}

impl KeyspaceTerm {
    pub fn new(keyspace: &str, alias: &str, fingerprint: Uuid) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            alias: alias.to_string(),
            fingerprint,
        }
    }

    pub fn from_keyspace(ks: &dyn Keyspace, alias: &str) -> Self {
        Self::new(ks.name(), alias, ks.fingerprint())
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        match catalog.keyspace(&self.keyspace) {
            Some(ks) => ks.fingerprint() == self.fingerprint,
            None => false,
        }
    }
}

macro_rules! plan_ops {
    ($($variant:ident),+ $(,)?) => {
        /// A plan operator. One variant per operator kind; the variant
        /// name is the wire discriminator.
        #[derive(Debug, std::clone::Clone, PartialEq)]
        pub enum PlanOp {
            $($variant($variant),)+
        }

        impl PlanOp {
            /// The wire discriminator of this operator.
            pub fn name(&self) -> &'static str {
                match self {
                    $(PlanOp::$variant(_) => stringify!($variant),)+
                }
            }

            pub fn estimate(&self) -> &OptEstimate {
                match self {
                    $(PlanOp::$variant(op) => &op.estimate,)+
                }
            }

            fn payload_json(&self) -> serde_json::Result<Value> {
                match self {
                    $(PlanOp::$variant(op) => serde_json::to_value(op),)+
                }
            }
        }

        $(
            impl From<$variant> for PlanOp {
                fn from(op: $variant) -> Self {
                    PlanOp::$variant(op)
                }
            }
        )+

        pub(crate) fn registry_entries() -> Vec<(&'static str, registry::DecodeFn)> {
            vec![
                $(
                    (stringify!($variant), |v: Value| {
                        serde_json::from_value::<$variant>(v)
                            .map(PlanOp::$variant)
                            .map_err(PlanError::from)
                    }),
                )+
            ]
        }
    };
}

plan_ops! {
    PrimaryScan,
    IndexScan,
    KeyScan,
    ValueScan,
    Fetch,
    IntersectScan,
    OrderedIntersectScan,
    UnionScan,
    Join,
    NLJoin,
    HashJoin,
    Filter,
    InitialProject,
    FinalProject,
    InitialGroup,
    IntermediateGroup,
    FinalGroup,
    Distinct,
    Order,
    Limit,
    Offset,
    UnionAll,
    IntersectAll,
    ExceptAll,
    SendInsert,
    SendUpdate,
    SendDelete,
    Upsert,
    Clone,
    Set,
    Unset,
    Merge,
    Sequence,
    Parallel,
    Prepare,
    Discard,
    Stream,
    Collect,
    Authorize,
    CreateFunction,
}

impl PlanOp {
    pub fn cost(&self) -> f64 {
        self.estimate().cost
    }

    pub fn cardinality(&self) -> f64 {
        self.estimate().cardinality
    }

    pub fn fr_cost(&self) -> f64 {
        self.estimate().fr_cost
    }

    /// Operators that never mutate the datastore or the catalog.
    pub fn readonly(&self) -> bool {
        !matches!(
            self,
            PlanOp::SendInsert(_)
                | PlanOp::SendUpdate(_)
                | PlanOp::SendDelete(_)
                | PlanOp::Upsert(_)
                | PlanOp::Merge(_)
                | PlanOp::CreateFunction(_)
        )
    }

    /// Recursive structural check against the live catalog. A false
    /// result evicts a cached plan and forces replanning.
    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        match self {
            PlanOp::PrimaryScan(op) => op.verify(catalog),
            PlanOp::IndexScan(op) => op.verify(catalog),
            PlanOp::Fetch(op) => op.verify(catalog),
            PlanOp::IntersectScan(op) => op.verify(catalog),
            PlanOp::OrderedIntersectScan(op) => op.verify(catalog),
            PlanOp::UnionScan(op) => op.verify(catalog),
            PlanOp::Join(op) => op.verify(catalog),
            PlanOp::NLJoin(op) => op.verify(catalog),
            PlanOp::HashJoin(op) => op.verify(catalog),
            PlanOp::UnionAll(op) => op.verify(catalog),
            PlanOp::IntersectAll(op) => op.verify(catalog),
            PlanOp::ExceptAll(op) => op.verify(catalog),
            PlanOp::SendInsert(op) => op.verify(catalog),
            PlanOp::SendUpdate(op) => op.verify(catalog),
            PlanOp::SendDelete(op) => op.verify(catalog),
            PlanOp::Upsert(op) => op.verify(catalog),
            PlanOp::Merge(op) => op.verify(catalog),
            PlanOp::Sequence(op) => op.verify(catalog),
            PlanOp::Parallel(op) => op.verify(catalog),
            PlanOp::Authorize(op) => op.verify(catalog),
            PlanOp::KeyScan(_)
            | PlanOp::ValueScan(_)
            | PlanOp::Filter(_)
            | PlanOp::InitialProject(_)
            | PlanOp::FinalProject(_)
            | PlanOp::InitialGroup(_)
            | PlanOp::IntermediateGroup(_)
            | PlanOp::FinalGroup(_)
            | PlanOp::Distinct(_)
            | PlanOp::Order(_)
            | PlanOp::Limit(_)
            | PlanOp::Offset(_)
            | PlanOp::Clone(_)
            | PlanOp::Set(_)
            | PlanOp::Unset(_)
            | PlanOp::Prepare(_)
            | PlanOp::Discard(_)
            | PlanOp::Stream(_)
            | PlanOp::Collect(_)
            | PlanOp::CreateFunction(_) => true,
        }
    }

    /// Wire form of this plan subtree.
    pub fn to_value(&self) -> Result<Value, PlanError> {
        let mut value = self.payload_json()?;
        match value {
            Value::Object(ref mut map) => {
                map.insert(
                    "#operator".to_string(),
                    Value::String(self.name().to_string()),
                );
            }
            _ => {
                return Err(PlanError::Decode(serde::de::Error::custom(
                    "plan payload must serialize to an object",
                )))
            }
        }
        Ok(value)
    }

    pub fn to_json_string(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Decode a plan subtree from its wire form.
    pub fn from_value(v: &Value) -> Result<PlanOp, PlanError> {
        let name = v
            .get("#operator")
            .and_then(Value::as_str)
            .ok_or(PlanError::MissingDiscriminator)?;
        registry::decode(name, v.clone())
    }

    pub fn from_json_str(text: &str) -> Result<PlanOp, PlanError> {
        let v: Value = serde_json::from_str(text)?;
        Self::from_value(&v)
    }
}

impl Serialize for PlanOp {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(s)
    }
}

impl<'de> Deserialize<'de> for PlanOp {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        PlanOp::from_value(&v).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datastore::{Index, IndexSpan, Keyspace, MemCatalog};
    use crate::expression::Expr;
    use serde_json::json;

    pub(crate) fn keyspace_term(name: &str) -> KeyspaceTerm {
        KeyspaceTerm::new(name, name, Uuid::new_v4())
    }

    pub(crate) fn index_scan(field: &str) -> IndexScan {
        IndexScan::new(
            keyspace_term("t"),
            &format!("idx_{}", field),
            Uuid::new_v4(),
            IndexSpan::Eq(json!(1)),
            OptEstimate::unavailable(),
        )
    }

    fn roundtrip(op: PlanOp) {
        let text = op.to_json_string().unwrap();
        let back = PlanOp::from_json_str(&text).unwrap();
        assert_eq!(back, op, "wire form `{}` did not round-trip", text);
    }

    #[test]
    fn test_discriminator_is_first_key() {
        let op: PlanOp = Filter::new(Expr::ident("x"), OptEstimate::unavailable()).into();
        let text = op.to_json_string().unwrap();
        assert!(
            text.starts_with("{\"#operator\":\"Filter\""),
            "got: {}",
            text
        );
    }

    #[test]
    fn test_roundtrip_scans() {
        roundtrip(index_scan("b").into());
        roundtrip(PrimaryScan::new(keyspace_term("t"), Some(Expr::literal(5)), OptEstimate::new(1.0, 2.0, 3, 0.5)).into());
        roundtrip(KeyScan::new(Expr::literal(json!(["k1", "k2"])), OptEstimate::unavailable()).into());
        roundtrip(Fetch::new(keyspace_term("t"), OptEstimate::unavailable()).into());
        roundtrip(
            IntersectScan::new(
                Some(Expr::literal(10)),
                OptEstimate::new(4.0, 2.0, 16, 1.0),
                vec![index_scan("b").into(), index_scan("c").into()],
            )
            .into(),
        );
        roundtrip(
            UnionScan::new(
                None,
                OptEstimate::unavailable(),
                vec![index_scan("b").into(), index_scan("c").into()],
            )
            .into(),
        );
        roundtrip(
            OrderedIntersectScan::new(
                Some(Expr::literal(3)),
                OptEstimate::unavailable(),
                vec![index_scan("b").into(), index_scan("c").into()],
            )
            .into(),
        );
    }

    #[test]
    fn test_roundtrip_estimates_preserved() {
        let op: PlanOp = PrimaryScan::new(
            keyspace_term("t"),
            None,
            OptEstimate::new(12.5, 100.0, 64, 1.25),
        )
        .into();
        let text = op.to_json_string().unwrap();
        assert!(text.contains("optimizer_estimates"));
        assert!(text.contains("fr_cost"));
        let back = PlanOp::from_json_str(&text).unwrap();
        assert_eq!(back.estimate().cost, 12.5);
        assert_eq!(back.estimate().size, 64);
    }

    #[test]
    fn test_unavailable_estimates_not_serialized() {
        let op: PlanOp = Discard::new(OptEstimate::unavailable()).into();
        let text = op.to_json_string().unwrap();
        assert!(!text.contains("optimizer_estimates"));
    }

    #[test]
    fn test_roundtrip_merge_with_action_subtrees() {
        let update = PlanOp::Sequence(Sequence::new(
            vec![
                Clone::new("t", OptEstimate::unavailable()).into(),
                Set::new(
                    vec![SetTermDef {
                        path: Expr::ident("x"),
                        value: Expr::path("src.x"),
                    }],
                    OptEstimate::unavailable(),
                )
                .into(),
                SendUpdate::new(keyspace_term("t"), None, OptEstimate::unavailable()).into(),
            ],
            OptEstimate::unavailable(),
        ));
        let insert = PlanOp::Sequence(Sequence::new(
            vec![SendInsert::new(
                keyspace_term("t"),
                Some(Expr::path("src.id")),
                Some(Expr::ident("src")),
                None,
                OptEstimate::unavailable(),
            )
            .into()],
            OptEstimate::unavailable(),
        ));
        let merge: PlanOp = Merge::new(
            keyspace_term("t"),
            Some(Expr::path("src.id")),
            Some(update),
            None,
            Some(insert),
            OptEstimate::new(10.0, 5.0, 32, 2.0),
        )
        .into();
        roundtrip(merge);
    }

    #[test]
    fn test_roundtrip_groups_and_order() {
        let aggs = vec![AggregateDef {
            kind: crate::algebra::AggregateKind::Stddev,
            operand: Expr::path("t.x"),
            alias: "sd".into(),
        }];
        roundtrip(InitialGroup::new(vec![Expr::path("t.g")], aggs.clone(), OptEstimate::unavailable()).into());
        roundtrip(FinalGroup::new(vec![], aggs, OptEstimate::unavailable()).into());
        roundtrip(
            Order::new(
                vec![OrderDef {
                    expr: Expr::path("t.x"),
                    desc: true,
                }],
                OptEstimate::unavailable(),
            )
            .into(),
        );
    }

    #[test]
    fn test_roundtrip_composites() {
        let seq: PlanOp = Sequence::new(
            vec![
                PrimaryScan::new(keyspace_term("t"), None, OptEstimate::unavailable()).into(),
                Filter::new(Expr::path("t.a").eq(Expr::literal(1)), OptEstimate::unavailable())
                    .into(),
                Stream::new(OptEstimate::unavailable()).into(),
            ],
            OptEstimate::unavailable(),
        )
        .into();
        roundtrip(seq.clone());
        roundtrip(Parallel::new(seq, 4, OptEstimate::unavailable()).into());
        roundtrip(
            Authorize::new(
                "t",
                Discard::new(OptEstimate::unavailable()).into(),
                OptEstimate::unavailable(),
            )
            .into(),
        );
        roundtrip(CreateFunction::new("f", json!({"expr": "1"}), true, OptEstimate::unavailable()).into());
    }

    #[test]
    fn test_unknown_operator_is_decode_error() {
        let err = PlanOp::from_json_str(r##"{"#operator":"WarpDrive"}"##).unwrap_err();
        assert!(matches!(err, PlanError::UnknownOperator(_)));

        let err = PlanOp::from_json_str(r#"{"no_discriminator":1}"#).unwrap_err();
        assert!(matches!(err, PlanError::MissingDiscriminator));
    }

    #[test]
    fn test_readonly_classification() {
        let scan: PlanOp = PrimaryScan::new(keyspace_term("t"), None, OptEstimate::unavailable()).into();
        assert!(scan.readonly());
        let send: PlanOp = SendDelete::new(keyspace_term("t"), None, OptEstimate::unavailable()).into();
        assert!(!send.readonly());
    }

    #[test]
    fn test_verify_against_catalog() {
        let catalog = MemCatalog::new();
        let ks = catalog.create_keyspace("t");
        let idx = ks.create_index("by_b", "b");

        let term = KeyspaceTerm::new("t", "t", ks.fingerprint());
        let scan: PlanOp = IndexScan::new(
            term,
            "by_b",
            idx.fingerprint(),
            IndexSpan::Eq(json!(1)),
            OptEstimate::unavailable(),
        )
        .into();
        assert!(scan.verify(&catalog));

        // dropping the referenced index invalidates the plan
        ks.drop_index("by_b");
        assert!(!scan.verify(&catalog));
    }

    #[test]
    fn test_verify_fails_after_keyspace_drop() {
        let catalog = MemCatalog::new();
        let ks = catalog.create_keyspace("t");
        let plan: PlanOp = PrimaryScan::new(
            KeyspaceTerm::from_keyspace(ks.as_ref(), "t"),
            None,
            OptEstimate::unavailable(),
        )
        .into();
        assert!(plan.verify(&catalog));
        catalog.drop_keyspace("t");
        assert!(!plan.verify(&catalog));
    }
}
