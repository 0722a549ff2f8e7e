use crate::plugins::{Plugin, PluginName};
use std::collections::HashMap;

// Load bands, in the order they must appear after the critical prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Band {
    Master,
    LightMaster,
    Regular,
}

fn band(plugin: &Plugin) -> Band {
    if plugin.is_master {
        Band::Master
    } else if plugin.is_light_master {
        Band::LightMaster
    } else {
        Band::Regular
    }
}

/// Game-specific structural constraints on a plugin load order, plus the
/// deterministic repair that enforces them. Holds no persistent state.
#[derive(Debug, Clone, Default)]
pub struct OrderRules {
    critical: Vec<PluginName>,
}

impl OrderRules {
    /// `critical` is the game's fixed sequence of plugins that must load
    /// first, in exactly this order.
    pub fn new(critical: Vec<PluginName>) -> Self {
        OrderRules { critical }
    }

    pub fn none() -> Self {
        OrderRules::default()
    }

    /// Criticals from the fixed sequence that are actually present, keeping
    /// the fixed order. Absent criticals do not reserve a slot.
    fn present_criticals(&self, plugins: &[Plugin]) -> Vec<PluginName> {
        self.critical
            .iter()
            .filter(|name| plugins.iter().any(|plugin| &&plugin.name == name))
            .cloned()
            .collect()
    }

    /// True iff the order satisfies every structural constraint: the critical
    /// prefix is exact, no non-master precedes a master, light-masters sit in
    /// the band between masters and regular plugins, and every plugin loads
    /// after all of its declared masters.
    pub fn validate(&self, plugins: &[Plugin]) -> bool {
        let criticals = self.present_criticals(plugins);
        for (index, name) in criticals.iter().enumerate() {
            match plugins.get(index) {
                Some(plugin) if &plugin.name == name => {}
                _ => return false,
            }
        }

        // Criticals are pinned by name, not by band.
        let mut high_water = Band::Master;
        for plugin in plugins.iter().skip(criticals.len()) {
            let band = band(plugin);
            if band < high_water {
                return false;
            }
            high_water = band;
        }

        let position: HashMap<&PluginName, usize> = plugins
            .iter()
            .enumerate()
            .map(|(index, plugin)| (&plugin.name, index))
            .collect();
        for (index, plugin) in plugins.iter().enumerate() {
            for master in &plugin.masters {
                if let Some(&master_index) = position.get(master) {
                    if master_index > index {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Minimal-movement repair. Applied in passes; each pass only moves
    /// plugins violating that pass's rule, so everything already valid keeps
    /// its relative order and the result is reproducible.
    pub fn correct(&self, plugins: Vec<Plugin>) -> Vec<Plugin> {
        let mut order = plugins;

        // Pass 1: pin criticals to the front, in the fixed sequence.
        let criticals = self.present_criticals(&order);
        for (target, name) in criticals.iter().enumerate() {
            let current = order
                .iter()
                .position(|plugin| &plugin.name == name)
                .expect("present critical must be in the order");
            if current != target {
                let plugin = order.remove(current);
                order.insert(target, plugin);
            }
        }

        // Passes 2 and 3: stable-partition the tail into master, light-master
        // and regular bands. Criticals are already a valid prefix.
        let prefix = criticals.len();
        let tail: Vec<Plugin> = order.split_off(prefix);
        for wanted in [Band::Master, Band::LightMaster, Band::Regular] {
            for plugin in &tail {
                if band(plugin) == wanted {
                    order.push(plugin.clone());
                }
            }
        }

        // Pass 4: a plugin preceding the furthest of its declared masters
        // moves to immediately after that master. Moves can cascade, so
        // repeat until the order settles.
        let limit = order.len().saturating_mul(order.len()).max(1);
        for _ in 0..limit {
            if !shift_one_after_masters(&mut order) {
                break;
            }
        }

        order
    }
}

/// Finds the first plugin loading before one of its declared masters, moves
/// it to just after the furthest such master, and reports whether anything
/// moved.
fn shift_one_after_masters(order: &mut [Plugin]) -> bool {
    let position: HashMap<PluginName, usize> = order
        .iter()
        .enumerate()
        .map(|(index, plugin)| (plugin.name.clone(), index))
        .collect();

    for (index, plugin) in order.iter().enumerate() {
        let furthest = plugin
            .masters
            .iter()
            .filter_map(|master| position.get(master).copied())
            .max();
        if let Some(furthest) = furthest {
            if furthest > index {
                // Rotate the plugin into place right after its master.
                order[index..=furthest].rotate_left(1);
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(plugins: &[Plugin]) -> Vec<&str> {
        plugins.iter().map(|plugin| plugin.name.as_str()).collect()
    }

    fn rules(critical: &[&str]) -> OrderRules {
        OrderRules::new(critical.iter().map(|name| PluginName::new(name)).collect())
    }

    #[test]
    fn criticals_move_to_the_fixed_prefix() {
        let rules = rules(&["A.esm", "B.esm"]);
        let corrected = rules.correct(vec![
            Plugin::new("C.esp"),
            Plugin::new("B.esm"),
            Plugin::new("A.esm"),
        ]);
        assert_eq!(names(&corrected), ["A.esm", "B.esm", "C.esp"]);
    }

    #[test]
    fn plugin_moves_after_its_declared_master() {
        let rules = OrderRules::none();
        let corrected = rules.correct(vec![
            Plugin::new("D.esp").with_masters(&["E.esm"]),
            Plugin::new("E.esm"),
        ]);
        assert_eq!(names(&corrected), ["E.esm", "D.esp"]);
    }

    #[test]
    fn masters_partition_before_lights_before_regulars() {
        let rules = OrderRules::none();
        let corrected = rules.correct(vec![
            Plugin::new("quest.esp"),
            Plugin::new("patch.esl"),
            Plugin::new("core.esm"),
            Plugin::new("extra.esp"),
            Plugin::new("tiny.esl"),
        ]);
        assert_eq!(
            names(&corrected),
            ["core.esm", "patch.esl", "tiny.esl", "quest.esp", "extra.esp"]
        );
    }

    #[test]
    fn partitions_are_stable_within_each_band() {
        let rules = OrderRules::none();
        let corrected = rules.correct(vec![
            Plugin::new("b.esp"),
            Plugin::new("second.esm"),
            Plugin::new("a.esp"),
            Plugin::new("first.esm"),
        ]);
        // second.esm appeared before first.esm, b.esp before a.esp.
        assert_eq!(
            names(&corrected),
            ["second.esm", "first.esm", "b.esp", "a.esp"]
        );
    }

    #[test]
    fn master_chains_settle() {
        let rules = OrderRules::none();
        let corrected = rules.correct(vec![
            Plugin::new("c.esp").with_masters(&["b.esp"]),
            Plugin::new("b.esp").with_masters(&["a.esp"]),
            Plugin::new("a.esp"),
        ]);
        assert!(rules.validate(&corrected));
        assert_eq!(names(&corrected), ["a.esp", "b.esp", "c.esp"]);
    }

    #[test]
    fn correct_is_idempotent() {
        let rules = rules(&["A.esm"]);
        let input = vec![
            Plugin::new("late.esp").with_masters(&["dep.esm"]),
            Plugin::new("dep.esm"),
            Plugin::new("A.esm"),
            Plugin::new("light.esl"),
            Plugin::new("plain.esp"),
        ];
        let once = rules.correct(input);
        let twice = rules.correct(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn corrected_orders_always_validate() {
        let rules = rules(&["A.esm", "B.esm"]);
        let scrambles: Vec<Vec<Plugin>> = vec![
            vec![],
            vec![Plugin::new("solo.esp")],
            vec![
                Plugin::new("z.esp").with_masters(&["y.esl"]),
                Plugin::new("B.esm"),
                Plugin::new("y.esl"),
                Plugin::new("A.esm"),
                Plugin::new("m.esm"),
            ],
            vec![
                Plugin::new("a.esp"),
                Plugin::new("b.esp").with_masters(&["a.esp"]),
                Plugin::new("c.esm"),
            ],
        ];
        for scramble in scrambles {
            let corrected = rules.correct(scramble);
            assert!(rules.validate(&corrected), "invalid: {:?}", names(&corrected));
        }
    }

    #[test]
    fn validate_rejects_misplaced_orders() {
        let rules = rules(&["A.esm"]);
        assert!(!rules.validate(&[Plugin::new("x.esp"), Plugin::new("A.esm")]));
        assert!(!rules.validate(&[
            Plugin::new("A.esm"),
            Plugin::new("light.esl"),
            Plugin::new("late.esm"),
        ]));
        assert!(!rules.validate(&[
            Plugin::new("A.esm"),
            Plugin::new("d.esp").with_masters(&["e.esp"]),
            Plugin::new("e.esp"),
        ]));
    }

    #[test]
    fn declared_masters_missing_from_the_order_are_ignored() {
        let rules = OrderRules::none();
        let order = vec![Plugin::new("only.esp").with_masters(&["absent.esm"])];
        assert!(rules.validate(&order));
        assert_eq!(names(&rules.correct(order)), ["only.esp"]);
    }
}
