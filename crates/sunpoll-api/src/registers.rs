// ── Register map ──
//
// Address table and block decoders shared by every local link. Modbus TCP,
// Modbus RTU and the WiFi dongle all read the same register blocks; only
// the framing differs. Decoders never fail: a register outside the block
// simply yields `None`.

use crate::models::{
    FirmwareInfo, RawBattery, RawBatteryBank, RawControllerEnergy, RawControllerRuntime,
    RawEnergy, RawRuntime,
};
use crate::transport::RegisterRange;

/// Largest register count requested in one frame.
pub const MAX_REGISTERS_PER_READ: u16 = 40;

/// Battery modules addressed at most.
pub const MAX_BATTERY_MODULES: u16 = 8;

// ── Input register blocks ──────────────────────────────────────────

pub const RUNTIME_BLOCK: RegisterRange = RegisterRange::new(0, 68);
pub const PARALLEL_BLOCK: RegisterRange = RegisterRange::new(113, 1);
pub const ENERGY_BLOCK: RegisterRange = RegisterRange::new(28, 32);
pub const BATTERY_BLOCK: RegisterRange = RegisterRange::new(80, 27);
pub const BATTERY_MODULE_BASE: u16 = 5000;
pub const BATTERY_MODULE_STRIDE: u16 = 30;
pub const BATTERY_MODULE_LEN: u16 = 15;

pub const CONTROLLER_RUNTIME_BLOCK: RegisterRange = RegisterRange::new(0, 38);
pub const CONTROLLER_ENERGY_BLOCK: RegisterRange = RegisterRange::new(40, 40);

// ── Holding register blocks ────────────────────────────────────────

pub const FIRMWARE_BLOCK: RegisterRange = RegisterRange::new(0, 10);

mod input {
    pub const STATUS: u16 = 0;
    pub const VPV1: u16 = 1;
    pub const VBAT: u16 = 4;
    pub const SOC_SOH: u16 = 5;
    pub const PPV1: u16 = 7;
    pub const P_CHARGE: u16 = 10;
    pub const P_DISCHARGE: u16 = 11;
    pub const VAC_R: u16 = 12;
    pub const FAC: u16 = 15;
    pub const P_INV: u16 = 16;
    pub const P_REC: u16 = 17;
    pub const V_EPS: u16 = 20;
    pub const P_EPS: u16 = 24;
    pub const P_TO_GRID: u16 = 26;
    pub const P_TO_USER: u16 = 27;

    pub const E_PV1_DAY: u16 = 28;
    pub const E_INV_DAY: u16 = 31;
    pub const E_REC_DAY: u16 = 32;
    pub const E_CHG_DAY: u16 = 33;
    pub const E_DISCHG_DAY: u16 = 34;
    pub const E_EPS_DAY: u16 = 35;
    pub const E_TO_GRID_DAY: u16 = 36;
    pub const E_TO_USER_DAY: u16 = 37;
    pub const VBUS1: u16 = 38;

    pub const E_PV1_ALL: u16 = 40;
    pub const E_INV_ALL: u16 = 46;
    pub const E_REC_ALL: u16 = 48;
    pub const E_CHG_ALL: u16 = 50;
    pub const E_DISCHG_ALL: u16 = 52;
    pub const E_EPS_ALL: u16 = 54;
    pub const E_TO_GRID_ALL: u16 = 56;
    pub const E_TO_USER_ALL: u16 = 58;

    pub const T_INNER: u16 = 64;
    pub const T_RADIATOR1: u16 = 65;
    pub const T_BAT: u16 = 67;

    pub const PARALLEL: u16 = 113;

    pub const BMS_CHARGE_LIMIT: u16 = 81;
    pub const BMS_DISCHARGE_LIMIT: u16 = 82;
    pub const BMS_CHARGE_VREF: u16 = 83;
    pub const BMS_DISCHARGE_CUT: u16 = 84;
    pub const BAT_COUNT: u16 = 96;
    pub const BAT_CAPACITY: u16 = 97;
    pub const BAT_CURRENT: u16 = 98;
    pub const MAX_CELL_VOLT: u16 = 101;
    pub const MIN_CELL_VOLT: u16 = 102;
    pub const MAX_CELL_TEMP: u16 = 103;
    pub const MIN_CELL_TEMP: u16 = 104;
    pub const BAT_CYCLES: u16 = 106;
}

mod controller {
    pub const GRID_VOLT_L1: u16 = 0;
    pub const UPS_VOLT_L1: u16 = 2;
    pub const GRID_CURR_L1: u16 = 4;
    pub const LOAD_CURR_L1: u16 = 6;
    pub const GRID_POWER_L1: u16 = 8;
    pub const UPS_POWER_L1: u16 = 10;
    pub const LOAD_POWER_L1: u16 = 12;
    pub const GEN_POWER_L1: u16 = 14;
    pub const SMART_LOAD_POWER: u16 = 16;
    pub const AC_COUPLE_POWER: u16 = 24;
    pub const SMART_PORT_STATUS: u16 = 32;
    pub const GRID_FREQ: u16 = 36;

    pub const IMPORT_TODAY_L1: u16 = 40;
    pub const EXPORT_TODAY_L1: u16 = 42;
    pub const LOAD_TODAY_L1: u16 = 44;
    pub const UPS_TODAY_L1: u16 = 46;
    pub const IMPORT_TOTAL_L1: u16 = 48;
    pub const EXPORT_TOTAL_L1: u16 = 52;
    pub const LOAD_TOTAL_L1: u16 = 56;
    pub const UPS_TOTAL_L1: u16 = 60;
    pub const SMART_LOAD_TODAY: u16 = 64;
    pub const AC_COUPLE_TODAY: u16 = 72;
}

mod holding {
    pub const DEVICE_TYPE: u16 = 0;
    pub const FW_CODE: u16 = 7;
    pub const FW_VERSION: u16 = 9;
}

// ── RegisterBlock ──────────────────────────────────────────────────

/// A contiguous run of register words starting at `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBlock {
    start: u16,
    words: Vec<u16>,
}

impl RegisterBlock {
    pub fn new(start: u16, words: Vec<u16>) -> Self {
        Self { start, words }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        let offset = address.checked_sub(self.start)?;
        self.words.get(usize::from(offset)).copied()
    }

    pub fn get_i16(&self, address: u16) -> Option<i16> {
        self.get(address).map(signed)
    }

    /// Two-register value, low word first.
    pub fn get_u32(&self, address: u16) -> Option<u32> {
        let lo = self.get(address)?;
        let hi = self.get(address.checked_add(1)?)?;
        Some((u32::from(hi) << 16) | u32::from(lo))
    }

    /// ASCII text packed two characters per register, low byte first.
    pub fn ascii(&self, address: u16, registers: u16) -> Option<String> {
        let mut bytes = Vec::with_capacity(usize::from(registers) * 2);
        for i in 0..registers {
            let word = self.get(address.checked_add(i)?)?;
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let text: String = bytes
            .into_iter()
            .filter(|b| b.is_ascii_graphic())
            .map(char::from)
            .collect();
        Some(text)
    }

    fn pair<T>(&self, address: u16, read: impl Fn(&Self, u16) -> Option<T>) -> [Option<T>; 2] {
        [read(self, address), read(self, address.saturating_add(1))]
    }
}

/// Reinterpret a register word as a two's-complement value.
pub fn signed(word: u16) -> i16 {
    i16::from_ne_bytes(word.to_ne_bytes())
}

fn low_byte(word: u16) -> u8 {
    word.to_le_bytes()[0]
}

fn high_byte(word: u16) -> u8 {
    word.to_le_bytes()[1]
}

// ── Decoders ───────────────────────────────────────────────────────

/// Decode the inverter runtime block (plus the optional parallel register).
pub fn decode_runtime(block: &RegisterBlock, parallel: Option<&RegisterBlock>) -> RawRuntime {
    let soc_soh = block.get(input::SOC_SOH);
    let parallel_word = parallel.and_then(|p| p.get(input::PARALLEL));

    RawRuntime {
        status: block.get(input::STATUS).unwrap_or_default(),
        vpv: [
            block.get(input::VPV1),
            block.get(input::VPV1 + 1),
            block.get(input::VPV1 + 2),
        ],
        ppv: [
            block.get(input::PPV1),
            block.get(input::PPV1 + 1),
            block.get(input::PPV1 + 2),
        ],
        vbat: block.get(input::VBAT),
        soc: soc_soh.map(low_byte),
        soh: soc_soh.map(high_byte),
        p_charge: block.get(input::P_CHARGE),
        p_discharge: block.get(input::P_DISCHARGE),
        vac: block.get(input::VAC_R),
        fac: block.get(input::FAC),
        p_inv: block.get(input::P_INV),
        p_rec: block.get(input::P_REC),
        p_eps: block.get(input::P_EPS),
        v_eps: block.get(input::V_EPS),
        p_to_grid: block.get(input::P_TO_GRID),
        p_to_user: block.get(input::P_TO_USER),
        vbus: block.pair(input::VBUS1, RegisterBlock::get),
        t_inner: block.get_i16(input::T_INNER),
        t_radiator: block.pair(input::T_RADIATOR1, RegisterBlock::get_i16),
        t_bat: block.get_i16(input::T_BAT),
        parallel_group: parallel_word.map(high_byte),
        parallel_role: parallel_word.map(low_byte),
    }
}

/// Decode the inverter energy block.
pub fn decode_energy(block: &RegisterBlock) -> RawEnergy {
    RawEnergy {
        pv_today: [
            block.get(input::E_PV1_DAY),
            block.get(input::E_PV1_DAY + 1),
            block.get(input::E_PV1_DAY + 2),
        ],
        inverter_today: block.get(input::E_INV_DAY),
        ac_charge_today: block.get(input::E_REC_DAY),
        charge_today: block.get(input::E_CHG_DAY),
        discharge_today: block.get(input::E_DISCHG_DAY),
        eps_today: block.get(input::E_EPS_DAY),
        export_today: block.get(input::E_TO_GRID_DAY),
        import_today: block.get(input::E_TO_USER_DAY),
        pv_total: [
            block.get_u32(input::E_PV1_ALL),
            block.get_u32(input::E_PV1_ALL + 2),
            block.get_u32(input::E_PV1_ALL + 4),
        ],
        inverter_total: block.get_u32(input::E_INV_ALL),
        ac_charge_total: block.get_u32(input::E_REC_ALL),
        charge_total: block.get_u32(input::E_CHG_ALL),
        discharge_total: block.get_u32(input::E_DISCHG_ALL),
        eps_total: block.get_u32(input::E_EPS_ALL),
        export_total: block.get_u32(input::E_TO_GRID_ALL),
        import_total: block.get_u32(input::E_TO_USER_ALL),
    }
}

/// Decode the battery bank summary block. Modules are appended separately.
pub fn decode_battery_bank(block: &RegisterBlock) -> RawBatteryBank {
    RawBatteryBank {
        module_count: block.get(input::BAT_COUNT),
        capacity_ah: block.get(input::BAT_CAPACITY),
        current: block.get_i16(input::BAT_CURRENT),
        charge_current_limit: block.get(input::BMS_CHARGE_LIMIT),
        discharge_current_limit: block.get(input::BMS_DISCHARGE_LIMIT),
        charge_voltage_ref: block.get(input::BMS_CHARGE_VREF),
        discharge_cutoff_voltage: block.get(input::BMS_DISCHARGE_CUT),
        max_cell_voltage: block.get(input::MAX_CELL_VOLT),
        min_cell_voltage: block.get(input::MIN_CELL_VOLT),
        max_cell_temp: block.get_i16(input::MAX_CELL_TEMP),
        min_cell_temp: block.get_i16(input::MIN_CELL_TEMP),
        cycle_count: block.get(input::BAT_CYCLES),
        modules: Vec::new(),
    }
}

/// Register range of battery module `index`.
pub fn battery_module_range(index: u16) -> RegisterRange {
    RegisterRange::new(
        BATTERY_MODULE_BASE + index * BATTERY_MODULE_STRIDE,
        BATTERY_MODULE_LEN,
    )
}

/// Decode one battery module block. An all-zero block means an empty slot.
pub fn decode_battery_module(index: u8, block: &RegisterBlock) -> Option<RawBattery> {
    if block.words().iter().all(|w| *w == 0) {
        return None;
    }
    let base = block.start();
    let serial = block.ascii(base + 9, 6).filter(|s| !s.is_empty());
    Some(RawBattery {
        index,
        serial,
        voltage: block.get(base),
        current: block.get_i16(base + 1),
        soc: block.get(base + 2).map(low_byte),
        soh: block.get(base + 3).map(low_byte),
        cycle_count: block.get(base + 4),
        max_cell_temp: block.get_i16(base + 5),
        min_cell_temp: block.get_i16(base + 6),
        max_cell_voltage: block.get(base + 7),
        min_cell_voltage: block.get(base + 8),
    })
}

/// Decode the holding-register identification block.
pub fn decode_firmware(block: &RegisterBlock) -> FirmwareInfo {
    let version = block.get(holding::FW_VERSION).unwrap_or_default();
    FirmwareInfo {
        code: block.ascii(holding::FW_CODE, 2).unwrap_or_default(),
        primary: high_byte(version),
        secondary: low_byte(version),
        device_type: block.get(holding::DEVICE_TYPE),
        model: None,
    }
}

/// Decode the grid controller runtime block.
pub fn decode_controller_runtime(block: &RegisterBlock) -> RawControllerRuntime {
    let mut smart_load_power = [[None; 2]; 4];
    let mut ac_couple_power = [[None; 2]; 4];
    let mut smart_port_status = [None; 4];
    for port in 0..4u16 {
        let slot = usize::from(port);
        smart_load_power[slot] =
            block.pair(controller::SMART_LOAD_POWER + port * 2, RegisterBlock::get_i16);
        ac_couple_power[slot] =
            block.pair(controller::AC_COUPLE_POWER + port * 2, RegisterBlock::get_i16);
        smart_port_status[slot] = block.get(controller::SMART_PORT_STATUS + port);
    }

    RawControllerRuntime {
        grid_voltage: block.pair(controller::GRID_VOLT_L1, RegisterBlock::get),
        ups_voltage: block.pair(controller::UPS_VOLT_L1, RegisterBlock::get),
        grid_current: block.pair(controller::GRID_CURR_L1, RegisterBlock::get),
        load_current: block.pair(controller::LOAD_CURR_L1, RegisterBlock::get),
        grid_power: block.pair(controller::GRID_POWER_L1, RegisterBlock::get_i16),
        ups_power: block.pair(controller::UPS_POWER_L1, RegisterBlock::get_i16),
        load_power: block.pair(controller::LOAD_POWER_L1, RegisterBlock::get_i16),
        generator_power: block.pair(controller::GEN_POWER_L1, RegisterBlock::get_i16),
        smart_load_power,
        ac_couple_power,
        smart_port_status,
        grid_frequency: block.get(controller::GRID_FREQ),
    }
}

/// Decode the grid controller energy block.
pub fn decode_controller_energy(block: &RegisterBlock) -> RawControllerEnergy {
    let u32_pair = |address: u16| [block.get_u32(address), block.get_u32(address + 2)];
    let mut smart_load_today = [[None; 2]; 4];
    let mut ac_couple_today = [[None; 2]; 4];
    for port in 0..4u16 {
        let slot = usize::from(port);
        smart_load_today[slot] =
            block.pair(controller::SMART_LOAD_TODAY + port * 2, RegisterBlock::get);
        ac_couple_today[slot] =
            block.pair(controller::AC_COUPLE_TODAY + port * 2, RegisterBlock::get);
    }

    RawControllerEnergy {
        import_today: block.pair(controller::IMPORT_TODAY_L1, RegisterBlock::get),
        export_today: block.pair(controller::EXPORT_TODAY_L1, RegisterBlock::get),
        load_today: block.pair(controller::LOAD_TODAY_L1, RegisterBlock::get),
        ups_today: block.pair(controller::UPS_TODAY_L1, RegisterBlock::get),
        import_total: u32_pair(controller::IMPORT_TOTAL_L1),
        export_total: u32_pair(controller::EXPORT_TOTAL_L1),
        load_total: u32_pair(controller::LOAD_TOTAL_L1),
        ups_total: u32_pair(controller::UPS_TOTAL_L1),
        smart_load_today,
        ac_couple_today,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn block_with(start: u16, len: u16, values: &[(u16, u16)]) -> RegisterBlock {
        let mut words = vec![0u16; usize::from(len)];
        for (addr, value) in values {
            words[usize::from(addr - start)] = *value;
        }
        RegisterBlock::new(start, words)
    }

    #[test]
    fn runtime_unpacks_soc_and_soh() {
        let block = block_with(0, 68, &[(5, (97 << 8) | 64), (7, 1200), (8, 800)]);
        let raw = decode_runtime(&block, None);
        assert_eq!(raw.soc, Some(64));
        assert_eq!(raw.soh, Some(97));
        assert_eq!(raw.ppv, [Some(1200), Some(800), Some(0)]);
        assert_eq!(raw.parallel_group, None);
    }

    #[test]
    fn runtime_reads_signed_temperatures() {
        let block = block_with(0, 68, &[(64, 0xFFF6)]);
        let raw = decode_runtime(&block, None);
        assert_eq!(raw.t_inner, Some(-10));
    }

    #[test]
    fn parallel_register_splits_group_and_role() {
        let runtime = block_with(0, 68, &[]);
        let parallel = block_with(113, 1, &[(113, (2 << 8) | 1)]);
        let raw = decode_runtime(&runtime, Some(&parallel));
        assert_eq!(raw.parallel_group, Some(2));
        assert_eq!(raw.parallel_role, Some(1));
    }

    #[test]
    fn energy_totals_are_low_word_first() {
        let block = block_with(28, 32, &[(40, 0x0001), (41, 0x0002), (36, 55)]);
        let raw = decode_energy(&block);
        assert_eq!(raw.pv_total[0], Some(0x0002_0001));
        assert_eq!(raw.export_today, Some(55));
    }

    #[test]
    fn firmware_block_decodes_code_and_revisions() {
        let mut words = vec![0u16; 10];
        words[7] = u16::from_le_bytes([b'F', b'A']);
        words[8] = u16::from_le_bytes([b'A', b'B']);
        words[9] = 0x2526;
        let fw = decode_firmware(&RegisterBlock::new(0, words));
        assert_eq!(fw.code, "FAAB");
        assert_eq!(fw.version(), "FAAB-2526");
        assert_eq!(fw.primary, 0x25);
        assert_eq!(fw.secondary, 0x26);
    }

    #[test]
    fn empty_battery_slot_is_skipped() {
        let range = battery_module_range(1);
        let empty = RegisterBlock::new(range.start, vec![0; usize::from(range.count)]);
        assert!(decode_battery_module(1, &empty).is_none());

        let mut words = vec![0u16; usize::from(range.count)];
        words[0] = 5320;
        words[2] = 88;
        let module = decode_battery_module(1, &RegisterBlock::new(range.start, words)).unwrap();
        assert_eq!(module.voltage, Some(5320));
        assert_eq!(module.soc, Some(88));
        assert_eq!(module.serial, None);
    }

    #[test]
    fn controller_ports_decode_per_port() {
        let block = block_with(0, 38, &[(18, 300), (19, 310), (33, 1), (34, 2)]);
        let raw = decode_controller_runtime(&block);
        assert_eq!(raw.smart_load_power[1], [Some(300), Some(310)]);
        assert_eq!(raw.smart_port_status, [Some(0), Some(1), Some(2), Some(0)]);
    }
}
