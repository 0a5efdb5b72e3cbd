//! Modbus RTU client over a shared serial bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

use crate::config::{BusConfig, MeterConfig};
use crate::error::TransactionError;
use crate::registers::{ReadFunction, RegisterMap};
use crate::rtu::{EXCEPTION_FLAG, EXCEPTION_LEN, REQUEST_LEN, ReadRequest, hex};

/// Lower bound on the response timeout derived from the baud rate.
pub const MIN_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Bits per character on the wire: start, 8 data, parity or second stop, stop.
const BITS_PER_CHAR: u64 = 11;

/// Response timeout for one exchange at `baud_rate`.
///
/// Twice the wire time of both frames plus the 3.5-character gaps, never
/// below [`MIN_RESPONSE_TIMEOUT`].
pub fn response_timeout(baud_rate: u32, request_len: usize, response_len: usize) -> Duration {
    let char_us = BITS_PER_CHAR * 1_000_000 / baud_rate.max(1) as u64;
    let frames_us = char_us * (request_len + response_len) as u64;
    let gaps_us = char_us * 7;
    Duration::from_micros(2 * (frames_us + gaps_us)).max(MIN_RESPONSE_TIMEOUT)
}

/// Response timeout of a meter: the configured value, or one derived from
/// the bus baud rate and the meter's longest read.
pub fn meter_timeout(meter: &MeterConfig, bus: &BusConfig) -> Duration {
    if let Some(ms) = meter.timeout_ms {
        return Duration::from_millis(ms);
    }

    let longest = RegisterMap::jsy_mk333(meter.function)
        .select(meter.channel_set())
        .request_blocks()
        .iter()
        .map(|block| block.count)
        .max()
        .unwrap_or(0);
    let request = ReadRequest::new(meter.address, meter.function, 0, longest);

    response_timeout(bus.baud_rate, REQUEST_LEN, request.response_len())
}

/// Silent interval that marks the end of an RTU frame.
pub fn frame_gap(baud_rate: u32) -> Duration {
    let gap_us = BITS_PER_CHAR * 3_500_000 / baud_rate.max(1) as u64;
    Duration::from_micros(gap_us.max(1750))
}

struct BusPort<T> {
    port: T,
    /// Set after an exchange that may have left bytes in the receive buffer.
    dirty: bool,
}

/// A serial bus shared by every meter wired to it.
///
/// The port lock is held from request write until the response is read, so
/// exchanges never interleave. Waiters are served in FIFO order.
pub struct SharedBus<T> {
    name: Arc<str>,
    gap: Duration,
    inner: Arc<Mutex<BusPort<T>>>,
}

impl<T> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            gap: self.gap,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedBus<T> {
    pub fn new(name: impl Into<Arc<str>>, baud_rate: u32, port: T) -> Self {
        Self {
            name: name.into(),
            gap: frame_gap(baud_rate),
            inner: Arc::new(Mutex::new(BusPort { port, dirty: false })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Open the serial port of a bus.
pub fn open_serial(config: &BusConfig) -> std::io::Result<tokio_serial::SerialStream> {
    let parity = match config.parity.to_lowercase().as_str() {
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };

    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };

    let builder = tokio_serial::new(&config.port, config.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits);

    tokio_serial::SerialStream::open(&builder).map_err(std::io::Error::from)
}

/// Issues read-registers requests on a [`SharedBus`].
pub struct ModbusClient<T> {
    bus: SharedBus<T>,
    function: ReadFunction,
    timeout: Duration,
}

impl<T> ModbusClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(bus: SharedBus<T>, function: ReadFunction, timeout: Duration) -> Self {
        Self {
            bus,
            function,
            timeout,
        }
    }

    pub fn function(&self) -> ReadFunction {
        self.function
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn bus(&self) -> &SharedBus<T> {
        &self.bus
    }

    /// Read `count` registers starting at `start` and return the data bytes.
    pub async fn read_registers(
        &self,
        device_address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u8>, TransactionError> {
        let request = ReadRequest::new(device_address, self.function, start, count);
        let frame = request.encode();

        let mut guard = self.bus.inner.lock().await;
        let bus = &mut *guard;

        if bus.dirty {
            let discarded = drain(&mut bus.port, self.bus.gap).await?;
            if discarded > 0 {
                debug!(bus = %self.bus.name, discarded, "Discarded stale bytes");
            }
            bus.dirty = false;
        }

        trace!(bus = %self.bus.name, "TX {}", hex(&frame));

        let deadline = Instant::now() + self.timeout;
        let result = match exchange(&mut bus.port, &frame, &request, deadline, self.timeout).await {
            Ok(response) => {
                trace!(bus = %self.bus.name, "RX {}", hex(&response));
                request.parse_response(&response).map(<[u8]>::to_vec)
            }
            Err(e) => Err(e),
        };

        // A rejected frame may be misaligned, with its tail still buffered.
        if result.is_err() {
            bus.dirty = true;
        }

        result
    }
}

async fn exchange<T>(
    port: &mut T,
    frame: &[u8],
    request: &ReadRequest,
    deadline: Instant,
    limit: Duration,
) -> Result<Vec<u8>, TransactionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert_eq!(frame.len(), REQUEST_LEN);

    match timeout_at(deadline, async {
        port.write_all(frame).await?;
        port.flush().await
    })
    .await
    {
        Err(_) => return Err(TransactionError::Timeout(limit)),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(())) => {}
    }

    read_response(port, request.response_len(), deadline, limit).await
}

/// Read one response frame. Exception frames end after [`EXCEPTION_LEN`]
/// bytes; normal frames after `expected` bytes.
async fn read_response<R>(
    port: &mut R,
    expected: usize,
    deadline: Instant,
    limit: Duration,
) -> Result<Vec<u8>, TransactionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; expected];
    let mut filled = 0;

    while filled < expected {
        if filled >= EXCEPTION_LEN && buf[1] & EXCEPTION_FLAG != 0 {
            buf.truncate(EXCEPTION_LEN);
            return Ok(buf);
        }

        match timeout_at(deadline, port.read(&mut buf[filled..])).await {
            Err(_) if filled == 0 => return Err(TransactionError::Timeout(limit)),
            Err(_) => {
                return Err(TransactionError::ShortRead {
                    expected,
                    received: filled,
                });
            }
            Ok(Ok(0)) if filled == 0 => {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            Ok(Ok(0)) => {
                return Err(TransactionError::ShortRead {
                    expected,
                    received: filled,
                });
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    Ok(buf)
}

/// Discard input until the line stays silent for `gap`.
async fn drain<R>(port: &mut R, gap: Duration) -> Result<usize, TransactionError>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 256];
    let mut discarded = 0;

    loop {
        match timeout(gap, port.read(&mut scratch)).await {
            Err(_) | Ok(Ok(0)) => return Ok(discarded),
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionCode;
    use crate::rtu::{encode_exception, encode_read_response};
    use tokio::io::{DuplexStream, duplex};

    fn client(timeout: Duration) -> (ModbusClient<DuplexStream>, DuplexStream) {
        let (ours, device) = duplex(1024);
        let bus = SharedBus::new("test", 9600, ours);
        (ModbusClient::new(bus, ReadFunction::Input, timeout), device)
    }

    async fn read_request(device: &mut DuplexStream) -> [u8; REQUEST_LEN] {
        let mut request = [0u8; REQUEST_LEN];
        device.read_exact(&mut request).await.unwrap();
        request
    }

    #[test]
    fn test_response_timeout_floor() {
        assert_eq!(response_timeout(9600, 8, 141), MIN_RESPONSE_TIMEOUT);
        assert_eq!(response_timeout(115_200, 8, 9), MIN_RESPONSE_TIMEOUT);
    }

    #[test]
    fn test_response_timeout_slow_line() {
        let timeout = response_timeout(1200, 8, 141);
        assert!(timeout > Duration::from_secs(2));
        assert!(timeout < Duration::from_secs(5));
    }

    #[test]
    fn test_meter_timeout() {
        let config = crate::config::JsyBridgeConfig::parse(
            r#"{ jsy: {
                buses: [{ name: "slow", port: "/dev/ttyS0", baud_rate: 1200 }],
                meters: [
                    { name: "a", bus: "slow", address: 1, phase_a: { voltage: {} } },
                    { name: "b", bus: "slow", address: 2, timeout_ms: 750, frequency: {} },
                ],
            } }"#,
        )
        .unwrap();
        let bus = &config.jsy.buses[0];

        // One register: 8 + 7 bytes on the wire at 1200 baud.
        assert_eq!(
            meter_timeout(&config.jsy.meters[0], bus),
            response_timeout(1200, REQUEST_LEN, 7)
        );
        assert_eq!(
            meter_timeout(&config.jsy.meters[1], bus),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_frame_gap() {
        assert_eq!(frame_gap(115_200), Duration::from_micros(1750));
        assert!(frame_gap(9600) > Duration::from_millis(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_registers() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            let request = read_request(&mut device).await;
            assert_eq!(request, [0x01, 0x04, 0x00, 0x00, 0x00, 0x02, 0x71, 0xCB]);
            let response = encode_read_response(0x01, ReadFunction::Input, &[0, 0, 0x27, 0x10]);
            device.write_all(&response).await.unwrap();
            device
        });

        let data = client.read_registers(0x01, 0x0000, 2).await.unwrap();
        assert_eq!(data, vec![0x00, 0x00, 0x27, 0x10]);
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_in_fragments() {
        let (client, mut device) = client(Duration::from_millis(500));

        tokio::spawn(async move {
            read_request(&mut device).await;
            let response = encode_read_response(0x01, ReadFunction::Input, &[0x12, 0x34]);
            for byte in response {
                device.write_all(&[byte]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            device
        });

        let data = client.read_registers(0x01, 0x0100, 1).await.unwrap();
        assert_eq!(data, vec![0x12, 0x34]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            device
        });

        let err = client.read_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(err, TransactionError::Timeout(d) if d == Duration::from_millis(500)));
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_response_is_short_read() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            device.write_all(&[0x01, 0x04, 0x04, 0x00]).await.unwrap();
            device
        });

        let err = client.read_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::ShortRead {
                expected: 9,
                received: 4
            }
        ));
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_frame() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            let response = encode_exception(0x01, ReadFunction::Input, 0x02);
            device.write_all(&response).await.unwrap();
            device
        });

        let err = client.read_registers(0x01, 0, 0x44).await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::DeviceException(ExceptionCode::IllegalDataAddress)
        ));
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_response() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            let mut response = encode_read_response(0x01, ReadFunction::Input, &[0, 0, 0x27, 0x10]);
            response[4] ^= 0x01;
            device.write_all(&response).await.unwrap();
            device
        });

        let err = client.read_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(err, TransactionError::CrcMismatch { .. }));
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_bytes_are_discarded_before_next_request() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            // Answer only after the client gave up.
            tokio::time::sleep(Duration::from_millis(600)).await;
            let late = encode_read_response(0x01, ReadFunction::Input, &[0xDE, 0xAD, 0xBE, 0xEF]);
            device.write_all(&late).await.unwrap();

            read_request(&mut device).await;
            let fresh = encode_read_response(0x01, ReadFunction::Input, &[0, 1, 0, 2]);
            device.write_all(&fresh).await.unwrap();
            device
        });

        assert!(client.read_registers(0x01, 0, 2).await.is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let data = client.read_registers(0x01, 0, 2).await.unwrap();
        assert_eq!(data, vec![0, 1, 0, 2]);
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_after_stray_byte() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            let first = encode_read_response(0x01, ReadFunction::Input, &[0, 0, 0x27, 0x10]);
            device.write_all(&[0x00]).await.unwrap();
            device.write_all(&first).await.unwrap();

            for _ in 0..2 {
                read_request(&mut device).await;
                let fresh = encode_read_response(0x01, ReadFunction::Input, &[0, 1, 0, 2]);
                device.write_all(&fresh).await.unwrap();
            }
            device
        });

        // The shifted frame leaves its last CRC byte behind.
        let err = client.read_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(err, TransactionError::CrcMismatch { .. }));

        for _ in 0..2 {
            let data = client.read_registers(0x01, 0, 2).await.unwrap();
            assert_eq!(data, vec![0, 1, 0, 2]);
        }
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_after_foreign_frame_tail() {
        let (client, mut device) = client(Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            read_request(&mut device).await;
            // Tail of another slave's frame, then a valid answer.
            let mut stale = encode_read_response(0x07, ReadFunction::Input, &[0x12, 0x34]);
            stale.drain(..2);
            let first = encode_read_response(0x01, ReadFunction::Input, &[0, 0, 0x27, 0x10]);
            device.write_all(&stale).await.unwrap();
            device.write_all(&first).await.unwrap();

            read_request(&mut device).await;
            let fresh = encode_read_response(0x01, ReadFunction::Input, &[0, 3, 0, 4]);
            device.write_all(&fresh).await.unwrap();
            device
        });

        assert!(client.read_registers(0x01, 0, 2).await.is_err());

        let data = client.read_registers(0x01, 0, 2).await.unwrap();
        assert_eq!(data, vec![0, 3, 0, 4]);
        let _device = responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_port() {
        let (client, device) = client(Duration::from_millis(500));
        drop(device);

        let err = client.read_registers(0x01, 0, 2).await.unwrap_err();
        assert!(matches!(err, TransactionError::Io(_)));
    }
}
