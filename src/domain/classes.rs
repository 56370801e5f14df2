//! Management Object Vocabulary
//!
//! Class, association, method and enumeration values of the array's
//! SMI-S provider. Kept in one place so the locator, the engines and the
//! simulated array agree on every name.

// =============================================================================
// Instance Classes
// =============================================================================

pub mod class {
    pub const STORAGE_SYSTEM: &str = "Symm_StorageSystem";
    pub const STORAGE_VOLUME: &str = "Symm_StorageVolume";
    pub const STORAGE_EXTENT: &str = "CIM_StorageExtent";
    pub const STORAGE_POOL: &str = "Symm_VirtualProvisioningPool";
    pub const DEVICE_MASKING_GROUP: &str = "SE_DeviceMaskingGroup";
    pub const INITIATOR_MASKING_GROUP: &str = "SE_InitiatorMaskingGroup";
    pub const TARGET_MASKING_GROUP: &str = "SE_TargetMaskingGroup";
    pub const MASKING_VIEW: &str = "Symm_LunMaskingView";
    pub const PROTOCOL_CONTROLLER_FOR_UNIT: &str = "CIM_ProtocolControllerForUnit";
    pub const STORAGE_HARDWARE_ID: &str = "SE_StorageHardwareID";
    pub const FC_ENDPOINT: &str = "Symm_FCSCSIProtocolEndpoint";
    pub const ISCSI_ENDPOINT: &str = "Symm_iSCSIProtocolEndpoint";
    pub const CONCRETE_JOB: &str = "SE_ConcreteJob";
    pub const STORAGE_SYNCHRONIZED: &str = "SE_StorageSynchronized_SV_SV";
    pub const TIER_POLICY_RULE: &str = "Symm_TierPolicyRule";
    pub const STORAGE_TIER: &str = "Symm_StorageTier";
    pub const TIER_POLICY_CAPABILITIES: &str = "Symm_TierPolicyServiceCapabilities";
}

// =============================================================================
// Services
// =============================================================================

pub mod service {
    pub const STORAGE_CONFIGURATION: &str = "Symm_StorageConfigurationService";
    pub const CONTROLLER_CONFIGURATION: &str = "Symm_ControllerConfigurationService";
    pub const ELEMENT_COMPOSITION: &str = "Symm_ElementCompositionService";
    pub const STORAGE_RELOCATION: &str = "Symm_StorageRelocationService";
    pub const REPLICATION: &str = "Symm_ReplicationService";
    pub const HARDWARE_ID_MANAGEMENT: &str = "Symm_StorageHardwareIDManagementService";
    pub const TIER_POLICY: &str = "Symm_TierPolicyService";
}

// =============================================================================
// Association Classes
// =============================================================================

pub mod assoc {
    pub const HOSTED_SERVICE: &str = "CIM_HostedService";
    pub const MEMBER_OF_COLLECTION: &str = "CIM_OrderedMemberOfCollection";
    pub const ASSOCIATED_INITIATOR_GROUP: &str = "CIM_AssociatedInitiatorMaskingGroup";
    pub const ASSOCIATED_DEVICE_GROUP: &str = "CIM_AssociatedDeviceMaskingGroup";
    pub const ASSOCIATED_TARGET_GROUP: &str = "CIM_AssociatedTargetMaskingGroup";
    pub const ALLOCATED_FROM_POOL: &str = "CIM_AllocatedFromStoragePool";
    pub const BASED_ON: &str = "CIM_BasedOn";
    pub const ASSOCIATED_TIER_POLICY: &str = "CIM_AssociatedTierPolicy";
    pub const CONCRETE_COMPONENT: &str = "CIM_ConcreteComponent";
    pub const POLICY_APPLIES_TO: &str = "CIM_TierPolicySetAppliesToElement";
    pub const AFFECTED_JOB_ELEMENT: &str = "CIM_AffectedJobElement";
    pub const ELEMENT_CAPABILITIES: &str = "CIM_ElementCapabilities";
}

// =============================================================================
// Methods
// =============================================================================

pub mod method {
    pub const CREATE_ELEMENT_FROM_POOL: &str = "CreateOrModifyElementFromStoragePool";
    pub const CREATE_COMPOSITE_ELEMENT: &str = "CreateOrModifyCompositeElement";
    pub const RETURN_TO_POOL: &str = "EMCReturnToStoragePool";
    pub const CREATE_GROUP: &str = "CreateGroup";
    pub const DELETE_GROUP: &str = "DeleteGroup";
    pub const ADD_MEMBERS: &str = "AddMembers";
    pub const REMOVE_MEMBERS: &str = "RemoveMembers";
    pub const CREATE_MASKING_VIEW: &str = "CreateMaskingView";
    pub const DELETE_MASKING_VIEW: &str = "DeleteMaskingView";
    pub const CREATE_HARDWARE_ID: &str = "EMCCreateStorageHardwareID";
    pub const CREATE_ELEMENT_REPLICA: &str = "CreateElementReplica";
    pub const MODIFY_REPLICA_SYNCHRONIZATION: &str = "ModifyReplicaSynchronization";
    pub const MODIFY_TIER_POLICY_RULE: &str = "ModifyStorageTierPolicyRule";
    pub const RELOCATE_TO_POOL: &str = "RelocateStorageVolumesToStoragePool";
}

// =============================================================================
// Return Codes
// =============================================================================

pub mod rc {
    /// Method completed synchronously
    pub const OK: u32 = 0;
    /// Method parameters checked, job started
    pub const JOB_STARTED: u32 = 4096;
    /// Generic failure reported by the provider
    pub const FAILED: u32 = 4;
    /// Object in use
    pub const IN_USE: u32 = 4097;
}

// =============================================================================
// Enumerations
// =============================================================================

/// `JobState` values of a concrete job
pub mod job_state {
    pub const NEW: u64 = 2;
    pub const STARTING: u64 = 3;
    pub const RUNNING: u64 = 4;
    pub const COMPLETED: u64 = 7;
    pub const TERMINATED: u64 = 8;
    pub const KILLED: u64 = 9;
    pub const EXCEPTION: u64 = 10;
    pub const SERVICE: u64 = 11;
}

/// `Type` argument of `CreateGroup`
pub mod group_type {
    pub const INITIATOR: u64 = 2;
    pub const TARGET: u64 = 3;
    pub const DEVICE: u64 = 4;
}

/// `CompositeType` argument of `CreateOrModifyCompositeElement`
pub mod composite_type {
    pub const STRIPED: u64 = 2;
    pub const CONCATENATED: u64 = 3;
}

/// `ElementType` argument: thin device
pub const ELEMENT_TYPE_THIN: u64 = 5;

/// `SyncType` argument of `CreateElementReplica`: full clone
pub const SYNC_TYPE_CLONE: u64 = 8;

/// `Operation` argument of `ModifyReplicaSynchronization`: detach
pub const SYNC_OPERATION_DETACH: u64 = 8;

/// `SyncState` values of a replica synchronization
pub mod sync_state {
    pub const SYNCHRONIZED: u64 = 6;
    pub const BROKEN: u64 = 13;
}

/// `Operation` argument of `ModifyStorageTierPolicyRule`
pub mod policy_operation {
    pub const ADD_ELEMENTS: u64 = 6;
    pub const REMOVE_ELEMENTS: u64 = 7;
}

/// `IDType` argument of `EMCCreateStorageHardwareID`
pub mod hardware_id_type {
    pub const PORT_WWN: u64 = 2;
    pub const ISCSI_NAME: u64 = 5;
}

/// Prefix of the array's storage system name
pub const SYSTEM_NAME_PREFIX: &str = "SYMMETRIX+";
