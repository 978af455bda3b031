use std::fmt;

use crate::error::ControlError;

/// Discrete auxiliary directive carried next to the continuous drive values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Aux {
    StepDown,
    #[default]
    Neutral,
    StepUp,
}

impl Aux {
    pub fn value(self) -> i8 {
        match self {
            Aux::StepDown => -1,
            Aux::Neutral => 0,
            Aux::StepUp => 1,
        }
    }
}

impl TryFrom<i8> for Aux {
    type Error = ControlError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Aux::StepDown),
            0 => Ok(Aux::Neutral),
            1 => Ok(Aux::StepUp),
            other => Err(ControlError::InvalidAux(other)),
        }
    }
}

/// A single motion command as written to the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotorCommand {
    pub left: i32,
    pub right: i32,
    pub aux: Aux,
}

impl MotorCommand {
    pub const STOP: MotorCommand = MotorCommand { left: 0, right: 0, aux: Aux::Neutral };

    pub fn new(left: i32, right: i32, aux: Aux) -> Self {
        MotorCommand { left, right, aux }
    }

    /// Wire payload: `left:right:aux` terminated by a newline.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.left, self.right, self.aux.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let command = MotorCommand::new(250, -100, Aux::Neutral);
        assert_eq!(command.encode(), b"250:-100:0\n".to_vec());
        assert_eq!(MotorCommand::STOP.encode(), b"0:0:0\n".to_vec());
        assert_eq!(MotorCommand::new(0, 0, Aux::StepDown).to_string(), "0:0:-1");
    }

    #[test]
    fn test_aux_from_i8() {
        assert_eq!(Aux::try_from(-1), Ok(Aux::StepDown));
        assert_eq!(Aux::try_from(0), Ok(Aux::Neutral));
        assert_eq!(Aux::try_from(1), Ok(Aux::StepUp));
        assert_eq!(Aux::try_from(2), Err(ControlError::InvalidAux(2)));
    }
}
