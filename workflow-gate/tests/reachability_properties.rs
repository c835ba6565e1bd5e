//! Property tests for the gate's reachability rules

use proptest::prelude::*;
use workflow_gate::*;

#[derive(Debug, Clone, Default)]
struct Flags {
    done: [bool; 5],
}

fn flag0(f: &Flags) -> bool {
    f.done[0]
}
fn flag1(f: &Flags) -> bool {
    f.done[1]
}
fn flag2(f: &Flags) -> bool {
    f.done[2]
}
fn flag3(f: &Flags) -> bool {
    f.done[3]
}

fn table() -> StepTable<Flags> {
    StepTable::builder()
        .step(StepDefinition::new("s0", "S0").complete_when(flag0).has_data_when(flag0))
        .step(StepDefinition::new("s1", "S1").complete_when(flag1).has_data_when(flag1))
        .step(StepDefinition::new("s2", "S2").complete_when(flag2).has_data_when(flag2))
        .step(StepDefinition::new("s3", "S3").complete_when(flag3).has_data_when(flag3))
        .step(StepDefinition::new("s4", "S4"))
        .build()
        .unwrap()
}

#[derive(Debug, Clone)]
enum Action {
    Toggle(usize),
    Navigate(usize),
    Edit(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..5usize).prop_map(Action::Toggle),
        (0..5usize).prop_map(Action::Navigate),
        (0..5usize).prop_map(Action::Edit),
    ]
}

fn position(gate: &WorkflowGate<Flags>, id: &StepId) -> usize {
    gate.table().index_of(id.as_str()).unwrap()
}

proptest! {
    #[test]
    fn highest_reached_never_decreases(actions in prop::collection::vec(action(), 1..60)) {
        let mut gate = WorkflowGate::new(table());
        let mut flags = Flags::default();
        let mut highest = 0;

        for action in actions {
            match action {
                Action::Toggle(i) => flags.done[i] = !flags.done[i],
                Action::Navigate(i) => {
                    let _ = gate.navigate_to_step(&format!("s{i}"), &flags);
                }
                Action::Edit(i) => {
                    gate.record_edit(&format!("s{i}"), &flags).unwrap();
                }
            }
            let now = position(&gate, &gate.highest_step_reached());
            prop_assert!(now >= highest);
            prop_assert!(position(&gate, &gate.current_step()) <= now);
            highest = now;
        }
    }

    #[test]
    fn accessible_steps_form_a_prefix(actions in prop::collection::vec(action(), 1..40)) {
        let mut gate = WorkflowGate::new(table());
        let mut flags = Flags::default();

        for action in actions {
            match action {
                Action::Toggle(i) => flags.done[i] = !flags.done[i],
                Action::Navigate(i) => {
                    let _ = gate.navigate_to_step(&format!("s{i}"), &flags);
                }
                Action::Edit(_) => {}
            }
        }

        let accessible = gate.accessible_steps(&flags);
        let highest = position(&gate, &gate.highest_step_reached());
        prop_assert!(accessible.len() >= highest + 1);
        prop_assert!(accessible.len() <= highest + 2);
        for (index, id) in accessible.iter().enumerate() {
            prop_assert_eq!(position(&gate, id), index);
        }
    }

    #[test]
    fn stale_steps_lie_after_the_edit(edit in 0..5usize, reach in 0..5usize) {
        let mut gate = WorkflowGate::new(table());
        let flags = Flags { done: [true; 5] };
        for _ in 0..reach {
            gate.advance(&flags).unwrap();
        }
        let flagged = gate.record_edit(&format!("s{edit}"), &flags).unwrap();
        for id in flagged {
            let index = position(&gate, &id);
            prop_assert!(index > edit);
            prop_assert!(index <= reach);
        }
    }
}
