//! Plan-to-execution tree construction
//!
//! One execution operator per plan node, built by exhaustive match over
//! the closed variant set. Keyspace and index references resolve
//! against the live catalog here; the stop handle of every built
//! operator is collected so the coordinator can reach the whole tree.

use std::sync::Arc;

use crate::core::{EngineConfig, Error, Result};
use crate::datastore::{Catalog, Index, Keyspace};
use crate::plan::PlanOp;

use super::base::StopHandle;
use super::{control, dml, join, merge, query, scan, setop, Operator};

/// Shared construction context: catalog and engine tunables. Parallel
/// fan-outs keep a handle to build their copies at run time.
pub struct BuildEnv {
    pub catalog: Arc<dyn Catalog>,
    pub config: EngineConfig,
}

impl BuildEnv {
    pub fn new(catalog: Arc<dyn Catalog>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { catalog, config })
    }

    fn keyspace(&self, name: &str) -> Result<Arc<dyn Keyspace>> {
        self.catalog
            .keyspace(name)
            .ok_or_else(|| Error::plan_internal(format!("keyspace `{}` not found", name)))
    }

    fn index(&self, keyspace: &str, index: &str) -> Result<Arc<dyn Index>> {
        self.keyspace(keyspace)?
            .index(index)
            .ok_or_else(|| {
                Error::plan_internal(format!(
                    "index `{}` not found on keyspace `{}`",
                    index, keyspace
                ))
            })
    }
}

/// Build the execution twin of a plan subtree. Every built operator's
/// stop handle lands in `stops`, in DFS order from the root.
pub fn build_exec(
    plan: &PlanOp,
    env: &Arc<BuildEnv>,
    stops: &mut Vec<StopHandle>,
) -> Result<Box<dyn Operator>> {
    let cap = env.config.pipeline_cap;
    let batch = env.config.batch_size;

    let op: Box<dyn Operator> = match plan {
        PlanOp::PrimaryScan(p) => Box::new(scan::PrimaryScan::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
        )),
        PlanOp::IndexScan(p) => Box::new(scan::IndexScan::new(
            p.clone(),
            env.index(&p.keyspace.keyspace, &p.index)?,
        )),
        PlanOp::KeyScan(p) => Box::new(scan::KeyScan::new(p.clone())),
        PlanOp::ValueScan(p) => Box::new(scan::ValueScan::new(p.clone())),
        PlanOp::Fetch(p) => Box::new(scan::Fetch::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
            batch,
        )),
        PlanOp::IntersectScan(p) => {
            let children = build_all(&p.scans, env, stops)?;
            Box::new(scan::IntersectScan::new(p.clone(), children, cap))
        }
        PlanOp::OrderedIntersectScan(p) => {
            let children = build_all(&p.scans, env, stops)?;
            Box::new(scan::OrderedIntersectScan::new(p.clone(), children, cap))
        }
        PlanOp::UnionScan(p) => {
            let children = build_all(&p.scans, env, stops)?;
            Box::new(scan::UnionScan::new(p.clone(), children, cap))
        }
        PlanOp::Join(p) => Box::new(join::Join::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
        )),
        PlanOp::NLJoin(p) => {
            let right = build_exec(&p.right, env, stops)?;
            Box::new(join::NLJoin::new(p.clone(), right, cap))
        }
        PlanOp::HashJoin(p) => {
            let right = build_exec(&p.right, env, stops)?;
            Box::new(join::HashJoin::new(p.clone(), right, cap))
        }
        PlanOp::Filter(p) => Box::new(query::Filter::new(p.clone())),
        PlanOp::InitialProject(p) => Box::new(query::InitialProject::new(p.clone())),
        PlanOp::FinalProject(p) => Box::new(query::FinalProject::new(p.clone())),
        PlanOp::InitialGroup(p) => Box::new(query::InitialGroup::new(p.clone())),
        PlanOp::IntermediateGroup(p) => Box::new(query::IntermediateGroup::new(p.clone())),
        PlanOp::FinalGroup(p) => Box::new(query::FinalGroup::new(p.clone())),
        PlanOp::Distinct(p) => Box::new(query::Distinct::new(p.clone())),
        PlanOp::Order(p) => Box::new(query::Order::new(p.clone())),
        PlanOp::Limit(p) => Box::new(query::Limit::new(p.clone())),
        PlanOp::Offset(p) => Box::new(query::Offset::new(p.clone())),
        PlanOp::UnionAll(p) => {
            let children = build_all(&p.children, env, stops)?;
            Box::new(setop::UnionAll::new(p.clone(), children))
        }
        PlanOp::IntersectAll(p) => {
            let first = build_exec(&p.first, env, stops)?;
            let second = build_exec(&p.second, env, stops)?;
            Box::new(setop::IntersectAll::new(p.clone(), first, second, cap))
        }
        PlanOp::ExceptAll(p) => {
            let first = build_exec(&p.first, env, stops)?;
            let second = build_exec(&p.second, env, stops)?;
            Box::new(setop::ExceptAll::new(p.clone(), first, second, cap))
        }
        PlanOp::SendInsert(p) => Box::new(dml::SendInsert::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
            batch,
        )),
        PlanOp::SendUpdate(p) => Box::new(dml::SendUpdate::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
            batch,
        )),
        PlanOp::SendDelete(p) => Box::new(dml::SendDelete::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
            batch,
        )),
        PlanOp::Upsert(p) => Box::new(dml::Upsert::new(
            p.clone(),
            env.keyspace(&p.keyspace.keyspace)?,
            batch,
        )),
        PlanOp::Clone(p) => Box::new(dml::Clone::new(p.clone())),
        PlanOp::Set(p) => Box::new(dml::Set::new(p.clone())),
        PlanOp::Unset(p) => Box::new(dml::Unset::new(p.clone())),
        PlanOp::Merge(p) => {
            let update = build_opt(&p.update, env, stops)?;
            let delete = build_opt(&p.delete, env, stops)?;
            let insert = build_opt(&p.insert, env, stops)?;
            Box::new(merge::Merge::new(
                p.clone(),
                env.keyspace(&p.keyspace.keyspace)?,
                update,
                delete,
                insert,
                cap,
            ))
        }
        PlanOp::Sequence(p) => {
            let children = build_all(&p.children, env, stops)?;
            Box::new(control::Sequence::new(p.clone(), children, cap))
        }
        PlanOp::Parallel(p) => Box::new(control::Parallel::new(p.clone(), Arc::clone(env))),
        PlanOp::Prepare(p) => Box::new(control::Prepare::new(p.clone())),
        PlanOp::Discard(p) => Box::new(control::Discard::new(p.clone())),
        PlanOp::Stream(p) => Box::new(control::Stream::new(p.clone())),
        PlanOp::Collect(p) => Box::new(control::Collect::new(p.clone())),
        PlanOp::Authorize(p) => {
            let child = build_exec(&p.child, env, stops)?;
            Box::new(control::Authorize::new(p.clone(), child))
        }
        PlanOp::CreateFunction(p) => Box::new(control::CreateFunction::new(p.clone())),
    };

    stops.push(op.base().stop_handle());
    Ok(op)
}

fn build_all(
    plans: &[PlanOp],
    env: &Arc<BuildEnv>,
    stops: &mut Vec<StopHandle>,
) -> Result<Vec<Box<dyn Operator>>> {
    plans
        .iter()
        .map(|p| build_exec(p, env, stops))
        .collect()
}

fn build_opt(
    plan: &Option<Box<PlanOp>>,
    env: &Arc<BuildEnv>,
    stops: &mut Vec<StopHandle>,
) -> Result<Option<Box<dyn Operator>>> {
    plan.as_ref()
        .map(|p| build_exec(p, env, stops))
        .transpose()
}
