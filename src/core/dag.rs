use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::core::stage::{StageId, StageKind, StagePlan};
use crate::error::{EngineError, Result};

/// DAG 调度器：校验 stage 依赖图并给出执行顺序
///
/// 顺序按依赖边决定（不比较 id 大小）：一个 stage 只在其全部依赖之后出现；
/// 同时就绪的 stage 按发现顺序的逆序排列。
pub struct GraphScheduler<'a> {
    plan: &'a StagePlan,
}

impl<'a> GraphScheduler<'a> {
    pub fn new(plan: &'a StagePlan) -> Self {
        Self { plan }
    }

    pub fn validate(&self) -> Result<()> {
        let ids: HashSet<StageId> = self.plan.iter().map(|(s, _)| s.id()).collect();
        if ids.len() != self.plan.len() {
            return Err(EngineError::Planning("duplicate stage id".into()));
        }
        let results = self
            .plan
            .iter()
            .filter(|(s, _)| s.kind() == StageKind::Result)
            .count();
        if results != 1 {
            return Err(EngineError::Planning(format!(
                "expected exactly one result stage, found {results}"
            )));
        }
        for (stage, deps) in self.plan.iter() {
            for dep in deps {
                if !ids.contains(dep) {
                    return Err(EngineError::Planning(format!(
                        "stage {} depends on unknown stage {}",
                        stage.id(),
                        dep
                    )));
                }
                match self.plan.stage(*dep) {
                    Some(s) if s.kind() == StageKind::ShuffleMap => {}
                    _ => {
                        return Err(EngineError::Planning(format!(
                            "stage {} depends on stage {} which produces no shuffle output",
                            stage.id(),
                            dep
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// 依赖优先的拓扑序；有环时报错
    pub fn execution_order(&self) -> Result<Vec<StageId>> {
        self.validate()?;

        // 逆发现顺序作为就绪 stage 之间的优先级
        let discovery: Vec<StageId> = self.plan.iter().map(|(s, _)| s.id()).collect();
        let mut remaining: HashMap<StageId, usize> = self
            .plan
            .iter()
            .map(|(s, deps)| (s.id(), deps.iter().collect::<HashSet<_>>().len()))
            .collect();
        let mut dependents: HashMap<StageId, Vec<StageId>> = HashMap::new();
        for (stage, deps) in self.plan.iter() {
            for dep in deps.iter().collect::<HashSet<_>>() {
                dependents.entry(*dep).or_default().push(stage.id());
            }
        }

        let mut order = Vec::with_capacity(discovery.len());
        let mut done: HashSet<StageId> = HashSet::new();
        while order.len() < discovery.len() {
            let next = discovery
                .iter()
                .rev()
                .find(|id| !done.contains(*id) && remaining.get(*id) == Some(&0))
                .copied();
            let Some(id) = next else {
                return Err(EngineError::Planning("cycle in stage dependencies".into()));
            };
            done.insert(id);
            order.push(id);
            for d in dependents.get(&id).into_iter().flatten() {
                if let Some(n) = remaining.get_mut(d) {
                    *n -= 1;
                }
            }
        }
        Ok(order)
    }

    /// 调试输出：每个 stage 一行
    pub fn explain(&self) -> String {
        let mut out = String::new();
        for (stage, deps) in self.plan.iter() {
            let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
            let _ = writeln!(
                out,
                "stage {} [{:?}] {} x{} <- [{}]",
                stage.id(),
                stage.kind(),
                stage.final_operator().name(),
                stage.partitions().len(),
                deps.join(", ")
            );
        }
        out
    }
}
