use chrono::Utc;
use rand::Rng;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const SEQUENCE_MASK: u32 = 0x00FF_FFFF;
// 62^4 > 2^24, así la secuencia siempre cabe en 4 dígitos
const SEQUENCE_WIDTH: usize = 4;

fn to_base62(mut n: u64) -> String {
    let mut out = Vec::new();
    loop {
        out.push(BASE62[(n % 62) as usize]);
        n /= 62;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    // solo contiene ASCII del alfabeto
    String::from_utf8(out).unwrap_or_default()
}

/// Genera ids ordenables por tiempo para las entradas del backlog:
/// timestamp en base62 + id de máquina + secuencia.
#[derive(Debug)]
pub struct SortableIdGenerator {
    machine_id: String,
    sequence: u32,
}

impl Default for SortableIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SortableIdGenerator {
    pub fn new() -> Self {
        let bytes: [u8; 3] = rand::rng().random();
        let machine_id = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self::with_machine_id(machine_id)
    }

    pub fn with_machine_id(machine_id: String) -> Self {
        Self {
            machine_id,
            sequence: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        self.next_id_at(millis)
    }

    pub fn next_id_at(&mut self, unix_millis: u64) -> String {
        self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
        format!(
            "{}{}{:0>width$}",
            to_base62(unix_millis),
            self.machine_id,
            to_base62(self.sequence as u64),
            width = SEQUENCE_WIDTH
        )
    }
}
