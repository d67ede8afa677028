use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Building {
    pub name: String,
    pub team: i32,
    pub health: u32,
    pub max_health: u32,
    pub armor: u32,
    pub max_armor: u32,
    pub capturable: bool,
    pub destroyed: bool,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl Building {
    fn new(name: &str) -> Building {
        Building {
            name: name.to_string(),
            team: -1,
            health: 0,
            max_health: 0,
            armor: 0,
            max_armor: 0,
            capturable: false,
            destroyed: false,
            destroyed_at: None,
        }
    }
}

#[derive(Default)]
pub struct BuildingTable {
    buildings: HashMap<String, Building>,
}

impl BuildingTable {
    /// Applies a status report, creating the building on first mention.
    /// Returns true when this report destroyed the building.
    pub fn report(
        &mut self,
        name: &str,
        team: i32,
        health: u32,
        max_health: u32,
        armor: u32,
        max_armor: u32,
        capturable: bool,
    ) -> bool {
        let building = self
            .buildings
            .entry(name.to_string())
            .or_insert_with(|| Building::new(name));
        building.team = team;
        building.health = health;
        building.max_health = max_health;
        building.armor = armor;
        building.max_armor = max_armor;
        building.capturable = capturable;

        if health == 0 && !building.destroyed {
            building.destroyed = true;
            building.destroyed_at = Some(Utc::now());
            return true;
        }
        false
    }

    pub fn capture(&mut self, name: &str, team: i32) {
        if let Some(b) = self.buildings.get_mut(name) {
            b.team = team;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Building> {
        self.buildings.get(name)
    }

    pub fn len(&self) -> usize {
        self.buildings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty()
    }

    pub fn clear(&mut self) {
        self.buildings.clear();
    }
}
