// attiny.rs - link to the low-power counter controller

use crc::{Crc, CRC_8_MAXIM_DOW};
use embedded_hal::i2c::I2c;

use crate::*;

pub const ATTINY_I2C_ADDR: u8 = 0x0A;

const CMD_GET_MODE: u8 = b'M';
const CMD_GET_DATA: u8 = b'B';
const CMD_TRANSMIT_MODE: u8 = b'T';
const CMD_SLEEP: u8 = b'Z';
const CMD_WAKE_PERIOD: u8 = b'S';
const CMD_COUNTER_KINDS: u8 = b'C';

// version, service, impulses0 (LE), impulses1 (LE), kind0, kind1, crc8
const DATA_FRAME_LEN: usize = 13;

/// Why the counter controller woke us up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeMode {
    Setup,
    AutoTransmit,
    ManualTransmit,
}

impl TryFrom<u8> for WakeMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Setup),
            2 => Ok(Self::AutoTransmit),
            3 => Ok(Self::ManualTransmit),
            _ => Err(()),
        }
    }
}

impl WakeMode {
    pub fn code(self) -> u8 {
        match self {
            Self::Setup => 1,
            Self::AutoTransmit => 2,
            Self::ManualTransmit => 3,
        }
    }
}

/// Counter state as held by the controller at wake time. Read once per session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttinyData {
    pub version: u8,
    pub service: u8,
    pub impulses0: u32,
    pub impulses1: u32,
    pub counter_type0: u8,
    pub counter_type1: u8,
}

pub trait Peripheral {
    fn get_mode(&mut self) -> AppResult<WakeMode>;
    fn get_snapshot(&mut self) -> AppResult<AttinyData>;
    /// Both slots are written together; false if the controller refused the pair.
    fn set_counter_kinds(&mut self, kind0: u8, kind1: u8) -> bool;
    fn set_wake_period(&mut self, minutes: u16) -> bool;
    fn set_transmit_mode(&mut self);
    fn set_sleep(&mut self);
}

pub struct AttinyLink<I> {
    i2c: I,
}

impl<I: I2c> AttinyLink<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    fn command(&mut self, cmd: &[u8]) -> AppResult<()> {
        self.i2c
            .write(ATTINY_I2C_ADDR, cmd)
            .map_err(|e| AppError::Peripheral(format!("write {:?} failed: {e:?}", cmd[0] as char)))
    }

    fn query(&mut self, cmd: u8, buf: &mut [u8]) -> AppResult<()> {
        self.i2c
            .write_read(ATTINY_I2C_ADDR, &[cmd], buf)
            .map_err(|e| AppError::Peripheral(format!("query {:?} failed: {e:?}", cmd as char)))
    }
}

fn parse_data_frame(frame: &[u8; DATA_FRAME_LEN]) -> AppResult<AttinyData> {
    let crc = Crc::<u8>::new(&CRC_8_MAXIM_DOW);
    let calc = crc.checksum(&frame[..DATA_FRAME_LEN - 1]);
    let read = frame[DATA_FRAME_LEN - 1];
    if calc != read {
        return Err(AppError::Peripheral(format!(
            "data CRC mismatch (read={read:02X} calc={calc:02X})"
        )));
    }
    Ok(AttinyData {
        version: frame[0],
        service: frame[1],
        impulses0: u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]),
        impulses1: u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]),
        counter_type0: frame[10],
        counter_type1: frame[11],
    })
}

impl<I: I2c> Peripheral for AttinyLink<I> {
    fn get_mode(&mut self) -> AppResult<WakeMode> {
        let mut buf = [0u8; 1];
        self.query(CMD_GET_MODE, &mut buf)?;
        WakeMode::try_from(buf[0])
            .map_err(|_| AppError::Peripheral(format!("unknown mode {}", buf[0])))
    }

    fn get_snapshot(&mut self) -> AppResult<AttinyData> {
        let mut frame = [0u8; DATA_FRAME_LEN];
        self.query(CMD_GET_DATA, &mut frame)?;
        let data = parse_data_frame(&frame)?;
        info!(
            "ATTINY: v{} imp0={} imp1={} ctype={},{}",
            data.version, data.impulses0, data.impulses1, data.counter_type0, data.counter_type1
        );
        Ok(data)
    }

    fn set_counter_kinds(&mut self, kind0: u8, kind1: u8) -> bool {
        let mut ack = [0u8; 1];
        let res = self
            .command(&[CMD_COUNTER_KINDS, kind0, kind1])
            .and_then(|_| {
                self.i2c
                    .read(ATTINY_I2C_ADDR, &mut ack)
                    .map_err(|e| AppError::Peripheral(format!("{e:?}")))
            });
        match res {
            Ok(()) if ack[0] == 1 => true,
            Ok(()) => {
                warn!("ATTINY: counter kinds {kind0},{kind1} rejected");
                false
            }
            Err(e) => {
                error!("ATTINY: {e}");
                false
            }
        }
    }

    fn set_wake_period(&mut self, minutes: u16) -> bool {
        let [hi, lo] = minutes.to_be_bytes();
        self.command(&[CMD_WAKE_PERIOD, hi, lo])
            .map_err(|e| error!("ATTINY: {e}"))
            .is_ok()
    }

    fn set_transmit_mode(&mut self) {
        if let Err(e) = self.command(&[CMD_TRANSMIT_MODE]) {
            error!("ATTINY: {e}");
        }
    }

    fn set_sleep(&mut self) {
        if let Err(e) = self.command(&[CMD_SLEEP]) {
            error!("ATTINY: {e}");
        }
    }
}


// EOF
