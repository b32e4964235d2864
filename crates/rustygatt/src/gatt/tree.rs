//! GATT tree model
//!
//! Services own characteristics, characteristics own descriptors. The
//! structure is immutable once discovered (client) or configured (server);
//! only attribute values change, and they live in a single value table so a
//! batch of writes can land atomically.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{GattError, Result};
use crate::gatt::constants::{CCCD, CCCD_DISABLED, HANDLE_MIN};
use crate::gatt::types::{CharacteristicProperty, Handle, Permission, ServiceType};
use crate::uuid::Uuid;

/// A characteristic descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    /// Descriptor handle, also its instance id
    pub handle: Handle,
    pub permissions: Permission,
}

impl Descriptor {
    pub fn is_cccd(&self) -> bool {
        self.uuid == CCCD
    }
}

/// A characteristic and its descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    /// Value handle, also the instance id
    pub handle: Handle,
    pub declaration_handle: Handle,
    pub properties: CharacteristicProperty,
    /// Empty for characteristics of a remote tree
    pub permissions: Permission,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Finds a descriptor by UUID. Duplicate UUIDs are rejected as ambiguous.
    pub fn descriptor(&self, uuid: Uuid) -> Result<&Descriptor> {
        unique(
            self.descriptors.iter().filter(|d| d.uuid == uuid),
            "Descriptor",
            uuid,
        )
    }

    /// Finds a descriptor by UUID and instance id
    pub fn descriptor_instance(&self, uuid: Uuid, handle: Handle) -> Result<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == uuid && d.handle == handle)
            .ok_or(GattError::NotFound {
                what: "Descriptor",
                uuid,
            })
    }

    /// The client characteristic configuration descriptor, if present
    pub fn cccd(&self) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.is_cccd())
    }
}

/// A service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    /// Declaration handle, also the instance id
    pub handle: Handle,
    pub end_handle: Handle,
    pub service_type: ServiceType,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Finds a characteristic by UUID.
    ///
    /// When the service exposes the UUID more than once the lookup fails with
    /// [`GattError::Ambiguous`]; use [`Service::characteristic_instance`].
    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        unique(
            self.characteristics.iter().filter(|c| c.uuid == uuid),
            "Characteristic",
            uuid,
        )
    }

    /// Finds a characteristic by UUID and instance id
    pub fn characteristic_instance(&self, uuid: Uuid, handle: Handle) -> Result<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid && c.handle == handle)
            .ok_or(GattError::NotFound {
                what: "Characteristic",
                uuid,
            })
    }

    /// All instances of a characteristic UUID, in declaration order
    pub fn characteristics_with_uuid(&self, uuid: Uuid) -> impl Iterator<Item = &Characteristic> {
        self.characteristics.iter().filter(move |c| c.uuid == uuid)
    }
}

fn unique<'a, T>(
    mut matches: impl Iterator<Item = &'a T>,
    what: &'static str,
    uuid: Uuid,
) -> Result<&'a T> {
    let first = matches.next().ok_or(GattError::NotFound { what, uuid })?;
    let rest = matches.count();
    if rest > 0 {
        return Err(GattError::Ambiguous {
            uuid,
            count: rest + 1,
        });
    }
    Ok(first)
}

/// What a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute<'a> {
    Characteristic(&'a Characteristic),
    Descriptor(&'a Characteristic, &'a Descriptor),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Characteristic(usize, usize),
    Descriptor(usize, usize, usize),
}

/// Services, characteristics and descriptors of one GATT server, plus the
/// current attribute values.
#[derive(Debug)]
pub struct GattTree {
    services: Vec<Service>,
    index: HashMap<Handle, Slot>,
    values: RwLock<HashMap<Handle, Vec<u8>>>,
}

impl GattTree {
    /// Builds a tree from discovered services. All values start empty.
    pub fn from_services(services: Vec<Service>) -> Self {
        let mut values = HashMap::new();
        let index = index_services(&services);
        for handle in index.keys() {
            values.insert(*handle, Vec::new());
        }
        Self {
            services,
            index,
            values: RwLock::new(values),
        }
    }

    /// Builds the local tree of a server, allocating handles in declaration
    /// order. Every notify/indicate characteristic gets a CCCD unless the
    /// configuration already declares one. Fails when the declarations need
    /// more handles than an attribute table has.
    pub fn build(configs: &[ServiceConfig]) -> Result<Self> {
        fn alloc(next: &mut u32) -> Result<Handle> {
            let handle = Handle::try_from(*next).map_err(|_| GattError::HandleSpaceExhausted)?;
            *next += 1;
            Ok(handle)
        }

        let mut next = u32::from(HANDLE_MIN);

        let mut services = Vec::with_capacity(configs.len());
        let mut values = HashMap::new();

        for config in configs {
            let service_handle = alloc(&mut next)?;
            let mut characteristics = Vec::with_capacity(config.characteristics.len());

            for char_config in &config.characteristics {
                let declaration_handle = alloc(&mut next)?;
                let value_handle = alloc(&mut next)?;
                values.insert(value_handle, char_config.initial_value.clone());

                let mut descriptors = Vec::new();
                for desc_config in &char_config.descriptors {
                    let handle = alloc(&mut next)?;
                    values.insert(handle, desc_config.initial_value.clone());
                    descriptors.push(Descriptor {
                        uuid: desc_config.uuid,
                        handle,
                        permissions: desc_config.permissions,
                    });
                }

                let has_cccd = descriptors.iter().any(|d| d.is_cccd());
                if char_config.properties.can_subscribe() && !has_cccd {
                    let handle = alloc(&mut next)?;
                    values.insert(handle, CCCD_DISABLED.to_vec());
                    descriptors.push(Descriptor {
                        uuid: CCCD,
                        handle,
                        permissions: Permission::read_write(),
                    });
                }

                characteristics.push(Characteristic {
                    uuid: char_config.uuid,
                    handle: value_handle,
                    declaration_handle,
                    properties: char_config.properties,
                    permissions: char_config.permissions,
                    descriptors,
                });
            }

            services.push(Service {
                uuid: config.uuid,
                handle: service_handle,
                end_handle: (next - 1) as Handle,
                service_type: config.service_type,
                characteristics,
            });
        }

        let index = index_services(&services);
        Ok(Self {
            services,
            index,
            values: RwLock::new(values),
        })
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Finds a service by UUID. Duplicate UUIDs are rejected as ambiguous.
    pub fn service(&self, uuid: Uuid) -> Result<&Service> {
        unique(
            self.services.iter().filter(|s| s.uuid == uuid),
            "Service",
            uuid,
        )
    }

    /// Finds a service by UUID and instance id
    pub fn service_instance(&self, uuid: Uuid, handle: Handle) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.uuid == uuid && s.handle == handle)
            .ok_or(GattError::NotFound {
                what: "Service",
                uuid,
            })
    }

    /// Resolves a characteristic value handle or a descriptor handle
    pub fn attribute(&self, handle: Handle) -> Result<Attribute<'_>> {
        match self.index.get(&handle) {
            Some(Slot::Characteristic(s, c)) => Ok(Attribute::Characteristic(
                &self.services[*s].characteristics[*c],
            )),
            Some(Slot::Descriptor(s, c, d)) => {
                let characteristic = &self.services[*s].characteristics[*c];
                Ok(Attribute::Descriptor(
                    characteristic,
                    &characteristic.descriptors[*d],
                ))
            }
            None => Err(GattError::HandleNotFound(handle)),
        }
    }

    pub fn characteristic_by_handle(&self, handle: Handle) -> Result<&Characteristic> {
        match self.attribute(handle)? {
            Attribute::Characteristic(c) => Ok(c),
            Attribute::Descriptor(..) => Err(GattError::HandleNotFound(handle)),
        }
    }

    pub fn descriptor_by_handle(&self, handle: Handle) -> Result<(&Characteristic, &Descriptor)> {
        match self.attribute(handle)? {
            Attribute::Descriptor(c, d) => Ok((c, d)),
            Attribute::Characteristic(_) => Err(GattError::HandleNotFound(handle)),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.index.contains_key(&handle)
    }

    /// Current value held for an attribute
    pub fn value(&self, handle: Handle) -> Result<Vec<u8>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values
            .get(&handle)
            .cloned()
            .ok_or(GattError::HandleNotFound(handle))
    }

    pub(crate) fn set_value(&self, handle: Handle, value: Vec<u8>) -> Result<()> {
        if !self.contains(handle) {
            return Err(GattError::HandleNotFound(handle));
        }
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(handle, value);
        Ok(())
    }

    /// Applies a batch of values under one lock. Either every handle is known
    /// and all values land, or nothing changes.
    pub(crate) fn set_values(&self, batch: &[(Handle, Vec<u8>)]) -> Result<()> {
        if let Some((handle, _)) = batch.iter().find(|(h, _)| !self.contains(*h)) {
            return Err(GattError::HandleNotFound(*handle));
        }
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        for (handle, value) in batch {
            values.insert(*handle, value.clone());
        }
        Ok(())
    }
}

impl PartialEq for GattTree {
    fn eq(&self, other: &Self) -> bool {
        if self.services != other.services {
            return false;
        }
        let ours = self.values.read().unwrap_or_else(|e| e.into_inner());
        let theirs = other.values.read().unwrap_or_else(|e| e.into_inner());
        *ours == *theirs
    }
}

fn index_services(services: &[Service]) -> HashMap<Handle, Slot> {
    let mut index = HashMap::new();
    for (s, service) in services.iter().enumerate() {
        for (c, characteristic) in service.characteristics.iter().enumerate() {
            index.insert(characteristic.handle, Slot::Characteristic(s, c));
            for (d, descriptor) in characteristic.descriptors.iter().enumerate() {
                index.insert(descriptor.handle, Slot::Descriptor(s, c, d));
            }
        }
    }
    index
}

/// Declaration of a local service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<CharacteristicConfig>,
}

impl ServiceConfig {
    pub fn primary(uuid: Uuid, characteristics: Vec<CharacteristicConfig>) -> Self {
        Self {
            uuid,
            service_type: ServiceType::Primary,
            characteristics,
        }
    }
}

/// Declaration of a local characteristic
#[derive(Debug, Clone)]
pub struct CharacteristicConfig {
    pub uuid: Uuid,
    pub properties: CharacteristicProperty,
    pub permissions: Permission,
    pub descriptors: Vec<DescriptorConfig>,
    pub initial_value: Vec<u8>,
}

impl CharacteristicConfig {
    pub fn new(uuid: Uuid, properties: CharacteristicProperty, permissions: Permission) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            descriptors: Vec::new(),
            initial_value: Vec::new(),
        }
    }

    pub fn with_initial_value(mut self, value: Vec<u8>) -> Self {
        self.initial_value = value;
        self
    }

    pub fn with_descriptor(mut self, descriptor: DescriptorConfig) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// Declaration of a local descriptor
#[derive(Debug, Clone)]
pub struct DescriptorConfig {
    pub uuid: Uuid,
    pub permissions: Permission,
    pub initial_value: Vec<u8>,
}

impl DescriptorConfig {
    pub fn new(uuid: Uuid, permissions: Permission) -> Self {
        Self {
            uuid,
            permissions,
            initial_value: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
    const LED: Uuid = Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123);
    const BUTTON: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);

    fn blinky() -> GattTree {
        GattTree::build(&[ServiceConfig::primary(
            SERVICE,
            vec![
                CharacteristicConfig::new(
                    LED,
                    CharacteristicProperty::READ | CharacteristicProperty::WRITE,
                    Permission::read_write(),
                )
                .with_initial_value(vec![0x00]),
                CharacteristicConfig::new(
                    BUTTON,
                    CharacteristicProperty::READ | CharacteristicProperty::NOTIFY,
                    Permission::READ,
                ),
                CharacteristicConfig::new(
                    BUTTON,
                    CharacteristicProperty::READ,
                    Permission::READ,
                ),
            ],
        )])
        .unwrap()
    }

    #[test]
    fn test_handle_space_limit() {
        let fill = |count| {
            vec![ServiceConfig::primary(
                SERVICE,
                vec![
                    CharacteristicConfig::new(LED, CharacteristicProperty::READ, Permission::READ);
                    count
                ],
            )]
        };
        // Service declaration plus two handles per characteristic
        let full = GattTree::build(&fill(0x7FFF)).unwrap();
        assert_eq!(full.services()[0].end_handle, 0xFFFF);
        assert_eq!(
            GattTree::build(&fill(0x8000)).map(|_| ()),
            Err(GattError::HandleSpaceExhausted)
        );
    }

    #[test]
    fn test_handles_are_allocated_in_declaration_order() {
        let tree = blinky();
        let service = tree.service(SERVICE).unwrap();
        assert_eq!(service.handle, 1);

        let led = service.characteristic(LED).unwrap();
        assert_eq!(led.declaration_handle, 2);
        assert_eq!(led.handle, 3);
        assert!(led.cccd().is_none());

        let buttons: Vec<_> = service.characteristics_with_uuid(BUTTON).collect();
        assert_eq!(buttons[0].handle, 5);
        // notify characteristic gets a CCCD right after its value
        assert_eq!(buttons[0].cccd().map(|d| d.handle), Some(6));
        assert_eq!(buttons[1].handle, 8);
        assert_eq!(service.end_handle, 8);
    }

    #[test]
    fn test_duplicate_uuid_requires_instance_id() {
        let tree = blinky();
        let service = tree.service(SERVICE).unwrap();

        assert_eq!(
            service.characteristic(BUTTON),
            Err(GattError::Ambiguous {
                uuid: BUTTON,
                count: 2
            })
        );
        let second = service.characteristic_instance(BUTTON, 8).unwrap();
        assert!(!second.properties.can_notify());
        assert!(service.characteristic_instance(BUTTON, 3).is_err());
    }

    #[test]
    fn test_missing_lookups_fail_with_not_found() {
        let tree = blinky();
        assert!(matches!(
            tree.service(Uuid::from_u16(0x180D)),
            Err(GattError::NotFound { what: "Service", .. })
        ));
        assert_eq!(tree.attribute(0x0100), Err(GattError::HandleNotFound(0x0100)));
    }

    #[test]
    fn test_values_are_held_per_handle() {
        let tree = blinky();
        assert_eq!(tree.value(3).unwrap(), vec![0x00]);
        assert_eq!(tree.value(6).unwrap(), CCCD_DISABLED.to_vec());

        tree.set_value(3, vec![0x01]).unwrap();
        assert_eq!(tree.value(3).unwrap(), vec![0x01]);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let tree = blinky();
        let result = tree.set_values(&[(3, vec![0xAA]), (0x0200, vec![0xBB])]);
        assert_eq!(result, Err(GattError::HandleNotFound(0x0200)));
        assert_eq!(tree.value(3).unwrap(), vec![0x00]);

        tree.set_values(&[(3, vec![0xAA]), (5, vec![0xBB])]).unwrap();
        assert_eq!(tree.value(3).unwrap(), vec![0xAA]);
        assert_eq!(tree.value(5).unwrap(), vec![0xBB]);
    }

    #[test]
    fn test_discovered_tree_has_same_shape_with_empty_values() {
        let local = blinky();
        let remote = GattTree::from_services(local.services().to_vec());
        assert_eq!(remote.services(), local.services());
        assert_eq!(remote.value(3).unwrap(), Vec::<u8>::new());
        assert_ne!(remote, local);
    }
}
