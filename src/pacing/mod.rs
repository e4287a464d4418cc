//! Character pacing
//!
//! Network packets deliver text in arbitrary bursts; rendering wants a steady
//! typing cadence. The pump explodes each packet payload into characters and
//! releases one character per tick of a periodic timer, so a burst queues up
//! and drains at constant rate.

use std::collections::VecDeque;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio::time::{self, MissedTickBehavior};

use crate::stream::{Packet, StreamError};

/// Default release cadence, one character every 30ms.
pub const DEFAULT_TICK: Duration = Duration::from_millis(30);

/// Pace a packet sequence into a per-character sequence.
///
/// On [`Packet::Done`] (or the packet stream ending) the remaining queue
/// drains at tick rate before the sequence completes. On an error the queue
/// is discarded and the error is the final item. Ticks are not banked while
/// the queue is empty, so a network stall does not cause a burst afterwards.
pub fn pace_characters<S>(
    packets: S,
    tick: Duration,
) -> impl Stream<Item = Result<char, StreamError>>
where
    S: Stream<Item = Result<Packet, StreamError>>,
{
    stream! {
        let mut ticker = time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        futures::pin_mut!(packets);
        let mut queue: VecDeque<char> = VecDeque::new();
        let mut done = false;

        enum Pulse {
            Packet(Option<Result<Packet, StreamError>>),
            Tick,
        }

        loop {
            if queue.is_empty() {
                if done {
                    break;
                }
                match packets.next().await {
                    Some(Ok(Packet::Data(text))) => queue.extend(text.chars()),
                    Some(Ok(Packet::Done)) | None => done = true,
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                }
                continue;
            }

            let pulse = tokio::select! {
                // Packet side first so a terminal error preempts queued output.
                biased;
                packet = packets.next(), if !done => Pulse::Packet(packet),
                _ = ticker.tick() => Pulse::Tick,
            };

            match pulse {
                Pulse::Packet(Some(Ok(Packet::Data(text)))) => queue.extend(text.chars()),
                Pulse::Packet(Some(Ok(Packet::Done)) | None) => done = true,
                Pulse::Packet(Some(Err(e))) => {
                    queue.clear();
                    yield Err(e);
                    break;
                }
                Pulse::Tick => {
                    if let Some(c) = queue.pop_front() {
                        yield Ok(c);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::iter;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_character_per_tick() {
        let packets = iter(vec![
            Ok(Packet::Data("Hello".to_string())),
            Ok(Packet::Done),
        ]);
        let chars = pace_characters(packets, ms(30));
        futures::pin_mut!(chars);

        let start = time::Instant::now();
        let mut emitted = Vec::new();
        let mut stamps = Vec::new();
        while let Some(item) = chars.next().await {
            emitted.push(item.unwrap());
            stamps.push(start.elapsed());
        }

        assert_eq!(emitted, vec!['H', 'e', 'l', 'l', 'o']);
        assert_eq!(stamps, vec![ms(0), ms(30), ms(60), ms(90), ms(120)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_are_smoothed() {
        let packets = iter(vec![
            Ok(Packet::Data("ab".to_string())),
            Ok(Packet::Data("cd".to_string())),
            Ok(Packet::Done),
        ]);
        let chars = pace_characters(packets, ms(30));
        futures::pin_mut!(chars);

        let start = time::Instant::now();
        let mut stamps = Vec::new();
        let mut emitted = Vec::new();
        while let Some(item) = chars.next().await {
            emitted.push(item.unwrap());
            stamps.push(start.elapsed());
        }

        assert_eq!(emitted, vec!['a', 'b', 'c', 'd']);
        assert_eq!(stamps, vec![ms(0), ms(30), ms(60), ms(90)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_discards_queued_characters() {
        let packets = iter(vec![
            Ok(Packet::Data("Hello".to_string())),
            Err(StreamError::MalformedPacket("boom".to_string())),
        ]);
        let chars = pace_characters(packets, ms(30));
        futures::pin_mut!(chars);

        let first = chars.next().await.expect("stream yields the error");
        assert!(matches!(first, Err(StreamError::MalformedPacket(_))));
        assert!(chars.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_on_end_of_stream() {
        let packets = iter(Vec::<Result<Packet, StreamError>>::new());
        let chars = pace_characters(packets, ms(30));
        futures::pin_mut!(chars);
        assert!(chars.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_emits_nothing() {
        let packets = iter(vec![Ok(Packet::Data(String::new())), Ok(Packet::Done)]);
        let chars = pace_characters(packets, ms(30));
        futures::pin_mut!(chars);
        assert!(chars.next().await.is_none());
    }
}
