// schedule.rs — Firing schedules of composite actors
//
// A schedule is computed outside the specializer and consumed here as data:
// per composite, either a dataflow firing list (actor, repetition count) in
// execution order, or a mode controller with its automaton. `bind` resolves
// the names of a schedule against the actor graph once, so the inliner and
// the interpreter work with entity handles only.
//
// Preconditions: schedules name children by their simple names.
// Postconditions: a `BoundSchedule` only refers to children of its composite.
// Failure modes: unknown actor, controller, refinement or state →
//   `SpecializeError::InternalConsistency`.
// Side effects: none.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpecializeError};
use crate::id::EntityId;
use crate::model::ActorGraph;

// ── Public types ────────────────────────────────────────────────────────────

fn one() -> u32 {
    1
}

/// One entry of a dataflow firing list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firing {
    pub actor: String,
    #[serde(default = "one")]
    pub repetitions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub guard: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

/// Finite automaton realized by a mode controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automaton {
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Dataflow {
        firings: Vec<Firing>,
    },
    Modal {
        controller: String,
        #[serde(default)]
        automaton: Automaton,
    },
}

/// Schedules of a whole graph, keyed by the composite's dotted full name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleSet {
    pub schedules: BTreeMap<String, Schedule>,
}

/// A schedule with every name resolved to a child entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundSchedule {
    Dataflow(Vec<(EntityId, u32)>),
    Modal {
        controller: EntityId,
        refinements: Vec<EntityId>,
    },
}

// ── Binding ─────────────────────────────────────────────────────────────────

impl ScheduleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, composite: &str, schedule: Schedule) {
        self.schedules.insert(composite.to_string(), schedule);
    }

    pub fn get(&self, graph: &ActorGraph, composite: EntityId) -> Option<&Schedule> {
        self.schedules.get(&graph.full_name(composite))
    }

    /// Bind the schedule of `composite`.
    pub fn bind(&self, graph: &ActorGraph, composite: EntityId) -> Result<BoundSchedule> {
        let schedule = self.get(graph, composite).ok_or_else(|| {
            SpecializeError::internal(format!(
                "composite `{}` has no schedule",
                graph.full_name(composite)
            ))
        })?;
        bind(graph, composite, schedule)
    }

    /// Every schedule must belong to a composite of the graph.
    pub fn validate(&self, graph: &ActorGraph) -> Result<()> {
        for name in self.schedules.keys() {
            match graph.entity_by_path(name) {
                Some(e) if graph.entity(e).composite => {}
                _ => {
                    return Err(SpecializeError::internal(format!(
                        "schedule for unknown composite `{}`",
                        name
                    )))
                }
            }
        }
        Ok(())
    }
}

fn child(graph: &ActorGraph, composite: EntityId, name: &str, role: &str) -> Result<EntityId> {
    graph.child_by_name(composite, name).ok_or_else(|| {
        SpecializeError::internal(format!(
            "schedule of `{}` names unknown {} `{}`",
            graph.full_name(composite),
            role,
            name
        ))
    })
}

/// Resolve the names of `schedule` against the children of `composite`.
pub fn bind(graph: &ActorGraph, composite: EntityId, schedule: &Schedule) -> Result<BoundSchedule> {
    match schedule {
        Schedule::Dataflow { firings } => firings
            .iter()
            .map(|f| Ok((child(graph, composite, &f.actor, "actor")?, f.repetitions)))
            .collect::<Result<Vec<_>>>()
            .map(BoundSchedule::Dataflow),
        Schedule::Modal {
            controller,
            automaton,
        } => {
            let controller = child(graph, composite, controller, "controller")?;
            let mut states = HashSet::new();
            let mut refinements = Vec::new();
            for state in &automaton.states {
                if !states.insert(state.name.as_str()) {
                    return Err(SpecializeError::internal(format!(
                        "automaton of `{}` repeats state `{}`",
                        graph.full_name(composite),
                        state.name
                    )));
                }
                if let Some(r) = &state.refinement {
                    let r = child(graph, composite, r, "refinement")?;
                    if !refinements.contains(&r) {
                        refinements.push(r);
                    }
                }
            }
            for t in &automaton.transitions {
                for end in [&t.from, &t.to] {
                    if !states.contains(end.as_str()) {
                        return Err(SpecializeError::internal(format!(
                            "transition of `{}` names unknown state `{}`",
                            graph.full_name(composite),
                            end
                        )));
                    }
                }
            }
            Ok(BoundSchedule::Modal {
                controller,
                refinements,
            })
        }
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Dataflow { firings } => {
                write!(f, "[")?;
                for (i, firing) in firings.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if firing.repetitions == 1 {
                        write!(f, "{}", firing.actor)?;
                    } else {
                        write!(f, "{}×{}", firing.actor, firing.repetitions)?;
                    }
                }
                write!(f, "]")
            }
            Schedule::Modal {
                controller,
                automaton,
            } => write!(
                f,
                "modal({}, {} states, {} transitions)",
                controller,
                automaton.states.len(),
                automaton.transitions.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntitySpec;

    fn graph() -> ActorGraph {
        let spec: EntitySpec = serde_json::from_str(
            r#"{"name": "top", "entities": [
                {"name": "A", "class": "Source"},
                {"name": "B", "class": "Sink"},
                {"name": "ctrl", "class": "Controller"}
            ]}"#,
        )
        .unwrap();
        ActorGraph::from_spec(&spec).unwrap()
    }

    #[test]
    fn binds_dataflow_firings() {
        let g = graph();
        let sched: Schedule = serde_json::from_str(
            r#"{"dataflow": {"firings": [{"actor": "A", "repetitions": 3}, {"actor": "B"}]}}"#,
        )
        .unwrap();
        let bound = bind(&g, g.root(), &sched).unwrap();
        let a = g.entity_by_path("top.A").unwrap();
        let b = g.entity_by_path("top.B").unwrap();
        assert_eq!(bound, BoundSchedule::Dataflow(vec![(a, 3), (b, 1)]));
        assert_eq!(sched.to_string(), "[A×3, B]");
    }

    #[test]
    fn unknown_actor_is_inconsistent() {
        let g = graph();
        let sched = Schedule::Dataflow {
            firings: vec![Firing {
                actor: "C".into(),
                repetitions: 1,
            }],
        };
        let err = bind(&g, g.root(), &sched).unwrap_err();
        assert!(matches!(err, SpecializeError::InternalConsistency(m) if m.contains("`C`")));
    }

    #[test]
    fn modal_checks_states_and_refinements() {
        let g = graph();
        let sched: Schedule = serde_json::from_str(
            r#"{"modal": {"controller": "ctrl", "automaton": {
                "states": [{"name": "idle"}, {"name": "run", "refinement": "A"}],
                "transitions": [{"from": "idle", "to": "run", "guard": "x > 0"}]
            }}}"#,
        )
        .unwrap();
        let bound = bind(&g, g.root(), &sched).unwrap();
        let BoundSchedule::Modal {
            controller,
            refinements,
        } = bound
        else {
            panic!("expected modal")
        };
        assert_eq!(controller, g.entity_by_path("top.ctrl").unwrap());
        assert_eq!(refinements.len(), 1);

        let bad = Schedule::Modal {
            controller: "ctrl".into(),
            automaton: Automaton {
                states: vec![State {
                    name: "idle".into(),
                    refinement: Some("ghost".into()),
                }],
                transitions: vec![],
            },
        };
        assert!(bind(&g, g.root(), &bad).is_err());
    }

    #[test]
    fn missing_schedule_is_reported() {
        let g = graph();
        let set = ScheduleSet::new();
        assert!(set.bind(&g, g.root()).is_err());
        let mut set = ScheduleSet::new();
        set.insert("top.A", Schedule::Dataflow { firings: vec![] });
        assert!(set.validate(&g).is_err());
    }
}
