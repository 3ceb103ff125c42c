use log::{info, warn};
use std::collections::HashMap;

use crate::error::StationError;
use crate::instrument::{CommandLog, Instrument, MockInstrument, SocketInstrument};
use crate::types::{DeviceRole, InstrumentStatus};

/// The four instruments of the bench, one slot per role
pub struct InstrumentSet {
    pub scope: Box<dyn Instrument>,
    pub gen_input: Box<dyn Instrument>,
    pub gen_ref: Box<dyn Instrument>,
    pub source: Box<dyn Instrument>,
}

impl InstrumentSet {
    pub fn get(&self, role: DeviceRole) -> &dyn Instrument {
        match role {
            DeviceRole::Oscilloscope => self.scope.as_ref(),
            DeviceRole::GeneratorInput => self.gen_input.as_ref(),
            DeviceRole::GeneratorReference => self.gen_ref.as_ref(),
            DeviceRole::Source => self.source.as_ref(),
        }
    }

    pub fn get_mut(&mut self, role: DeviceRole) -> &mut dyn Instrument {
        match role {
            DeviceRole::Oscilloscope => self.scope.as_mut(),
            DeviceRole::GeneratorInput => self.gen_input.as_mut(),
            DeviceRole::GeneratorReference => self.gen_ref.as_mut(),
            DeviceRole::Source => self.source.as_mut(),
        }
    }

    /// Send one command to one role
    pub fn send(&mut self, role: DeviceRole, command: &str) -> Result<(), StationError> {
        self.get_mut(role).send(command)
    }

    /// Send `*RST` to every instrument in registration order
    pub fn reset_all(&mut self) -> Result<(), StationError> {
        for role in DeviceRole::ALL {
            self.send(role, "*RST")?;
        }
        Ok(())
    }
}

/// Registry of the bench instruments and their connectivity state
pub struct InstrumentRegistry {
    instruments: InstrumentSet,
}

impl InstrumentRegistry {
    pub fn new(instruments: InstrumentSet) -> Self {
        Self { instruments }
    }

    /// Mock instruments at the default addresses, sharing one command log
    pub fn mock(log: CommandLog) -> Self {
        Self::new(InstrumentSet {
            scope: mock_at_default(DeviceRole::Oscilloscope, &log),
            gen_input: mock_at_default(DeviceRole::GeneratorInput, &log),
            gen_ref: mock_at_default(DeviceRole::GeneratorReference, &log),
            source: mock_at_default(DeviceRole::Source, &log),
        })
    }

    /// TCP socket instruments at the given addresses, default ones elsewhere
    pub fn socket(addresses: &HashMap<DeviceRole, String>) -> Self {
        let make = |role: DeviceRole| -> Box<dyn Instrument> {
            let address = addresses
                .get(&role)
                .map(String::as_str)
                .unwrap_or(role.default_address());
            Box::new(SocketInstrument::new(role, address))
        };
        Self::new(InstrumentSet {
            scope: make(DeviceRole::Oscilloscope),
            gen_input: make(DeviceRole::GeneratorInput),
            gen_ref: make(DeviceRole::GeneratorReference),
            source: make(DeviceRole::Source),
        })
    }

    /// Set target addresses; roles missing from the map keep their address
    pub fn configure(&mut self, addresses: &HashMap<DeviceRole, String>) {
        for (role, address) in addresses {
            info!("{role}: address {address}");
            self.instruments.get_mut(*role).set_address(address);
        }
    }

    /// Run discovery on every instrument.
    ///
    /// Returns true only if all of them were found. Every instrument is
    /// probed even after a miss so `status()` is complete.
    pub fn discover_all(&mut self) -> bool {
        let mut all_found = true;
        for role in DeviceRole::ALL {
            let instrument = self.instruments.get_mut(role);
            if !instrument.find() {
                warn!("{role} not found at {}", instrument.address());
                all_found = false;
            }
        }
        all_found
    }

    /// Forget discovery results; addresses are kept
    pub fn disconnect(&mut self) {
        for role in DeviceRole::ALL {
            let instrument = self.instruments.get_mut(role);
            let address = instrument.address().to_string();
            instrument.set_address(&address);
        }
    }

    /// One status per instrument, in registration order
    pub fn status(&self) -> Vec<(DeviceRole, InstrumentStatus)> {
        DeviceRole::ALL
            .iter()
            .map(|role| (*role, self.instruments.get(*role).status()))
            .collect()
    }

    pub fn addresses(&self) -> Vec<(DeviceRole, String)> {
        DeviceRole::ALL
            .iter()
            .map(|role| (*role, self.instruments.get(*role).address().to_string()))
            .collect()
    }

    pub fn instruments(&self) -> &InstrumentSet {
        &self.instruments
    }

    pub fn instruments_mut(&mut self) -> &mut InstrumentSet {
        &mut self.instruments
    }
}

fn mock_at_default(role: DeviceRole, log: &CommandLog) -> Box<dyn Instrument> {
    Box::new(MockInstrument::new(role, role.default_address(), log.clone()))
}

/// Resolve a name-keyed address table into roles
pub fn resolve_addresses(
    named: &HashMap<String, String>,
) -> Result<HashMap<DeviceRole, String>, StationError> {
    named
        .iter()
        .map(|(name, address)| Ok((name.parse::<DeviceRole>()?, address.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with_absent_source(log: &CommandLog) -> InstrumentSet {
        InstrumentSet {
            scope: mock_at_default(DeviceRole::Oscilloscope, log),
            gen_input: mock_at_default(DeviceRole::GeneratorInput, log),
            gen_ref: mock_at_default(DeviceRole::GeneratorReference, log),
            source: Box::new(
                MockInstrument::new(DeviceRole::Source, "GPIB1::3::INSTR", log.clone()).absent(),
            ),
        }
    }

    #[test]
    fn test_discover_all_found() {
        let mut registry = InstrumentRegistry::mock(CommandLog::new());
        assert!(registry.discover_all());
        assert!(registry.status().iter().all(|(_, s)| s.is_found()));
    }

    #[test]
    fn test_partial_discovery_is_failure() {
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::new(set_with_absent_source(&log));
        assert!(!registry.discover_all());

        let status = registry.status();
        assert_eq!(status[0], (DeviceRole::Oscilloscope, InstrumentStatus::Found));
        assert_eq!(status[3], (DeviceRole::Source, InstrumentStatus::NotFound));
    }

    #[test]
    fn test_disconnect_clears_status() {
        let mut registry = InstrumentRegistry::mock(CommandLog::new());
        registry.discover_all();
        registry.disconnect();
        assert!(
            registry
                .status()
                .iter()
                .all(|(_, s)| *s == InstrumentStatus::Unknown)
        );
        assert_eq!(registry.addresses()[3].1, "GPIB1::3::INSTR");
    }

    #[test]
    fn test_status_in_registration_order() {
        let registry = InstrumentRegistry::mock(CommandLog::new());
        let roles: Vec<DeviceRole> = registry.status().into_iter().map(|(r, _)| r).collect();
        assert_eq!(roles, DeviceRole::ALL.to_vec());
    }

    #[test]
    fn test_configure_overrides_addresses() {
        let mut registry = InstrumentRegistry::mock(CommandLog::new());
        let overrides = HashMap::from([(DeviceRole::GeneratorReference, "GPIB0::12::INSTR".to_string())]);
        registry.configure(&overrides);

        let addresses = registry.addresses();
        assert_eq!(addresses[2].1, "GPIB0::12::INSTR");
        assert_eq!(addresses[0].1, "GPIB1::7::INSTR");
    }

    #[test]
    fn test_reset_all_order() {
        let log = CommandLog::new();
        let mut registry = InstrumentRegistry::mock(log.clone());
        registry.instruments_mut().reset_all().unwrap();

        let roles: Vec<DeviceRole> = log.entries().iter().map(|c| c.role).collect();
        assert_eq!(roles, DeviceRole::ALL.to_vec());
        assert!(log.entries().iter().all(|c| c.command == "*RST"));
    }

    #[test]
    fn test_resolve_addresses() {
        let named = HashMap::from([
            ("scope".to_string(), "GPIB1::7::INSTR".to_string()),
            ("Generator-Input".to_string(), "GPIB1::19::INSTR".to_string()),
        ]);
        let resolved = resolve_addresses(&named).unwrap();
        assert_eq!(resolved[&DeviceRole::Oscilloscope], "GPIB1::7::INSTR");
        assert_eq!(resolved[&DeviceRole::GeneratorInput], "GPIB1::19::INSTR");

        let bad = HashMap::from([("analyzer".to_string(), "x".to_string())]);
        assert!(resolve_addresses(&bad).is_err());
    }
}
