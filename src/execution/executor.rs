use crate::config::SignalConfig;
use crate::models::Side;

/// Share of available funds an order may use, leaving room for slippage and fees
pub const FUNDS_SAFETY_MARGIN: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Flat,
    Short,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    /// Open or extend a position
    Open { side: Side, quantity: f64 },
    /// Close the whole position at market
    Flatten { side: Side, quantity: f64 },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

impl ExecutionDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: ExecutionAction::Skip,
            reason: reason.into(),
        }
    }
}

/// Arithmetic mean of indicator scores, 0 when there are none
pub fn mean_score(scores: &[i8]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|&s| f64::from(s)).sum::<f64>() / scores.len() as f64
}

/// Order quantity (counter units) affordable with `base_available` at `mid`
///
/// Balances are held in the market's base currency and prices are quoted in
/// base per counter, so the balance is divided by the price.
pub fn available_funds(mid: f64, base_available: f64) -> f64 {
    if mid <= 0.0 || !mid.is_finite() || base_available <= 0.0 {
        return 0.0;
    }
    base_available / mid * FUNDS_SAFETY_MARGIN
}

/// Turns a mean score and the current position into at most one order
pub struct Executor {
    config: SignalConfig,
    increment: f64,
}

impl Executor {
    pub fn new(config: SignalConfig, increment: f64) -> Self {
        Self { config, increment }
    }

    pub fn direction(&self, mean: f64) -> Direction {
        if mean > self.config.long_threshold {
            Direction::Long
        } else if mean < self.config.short_threshold {
            Direction::Short
        } else {
            Direction::Flat
        }
    }

    /// Decide what to do for one evaluated period
    ///
    /// `funds` is `None` when no mid price could be derived from the book.
    pub fn process_signal(
        &self,
        mean: f64,
        position: f64,
        funds: Option<f64>,
    ) -> ExecutionDecision {
        match self.direction(mean) {
            Direction::Flat => self.flatten(position, "score within thresholds"),

            Direction::Long => {
                // Crossing from short to long closes the short first
                if position < 0.0 {
                    return self.flatten(position, "long signal while short");
                }
                let cap_buffer = self.config.long_cap - position;
                self.size(Side::Buy, funds, cap_buffer)
            }

            Direction::Short => {
                if position > 0.0 {
                    return self.flatten(position, "short signal while long");
                }
                let cap_buffer = self.config.short_cap + position;
                self.size(Side::Sell, funds, cap_buffer)
            }
        }
    }

    /// Quantity = min(funds, lot_size, cap_buffer), skipped below the increment
    fn size(&self, side: Side, funds: Option<f64>, cap_buffer: f64) -> ExecutionDecision {
        let Some(funds) = funds else {
            return ExecutionDecision::skip("no mid price available");
        };

        let quantity = funds.min(self.config.lot_size).min(cap_buffer);
        if quantity <= 0.0 || quantity < self.increment {
            return ExecutionDecision::skip(format!(
                "quantity {:.8} below increment {} (funds {:.8}, cap buffer {:.8})",
                quantity.max(0.0),
                self.increment,
                funds,
                cap_buffer
            ));
        }

        ExecutionDecision {
            action: ExecutionAction::Open { side, quantity },
            reason: format!(
                "{:?} signal: funds {:.8}, lot {}, cap buffer {:.8}",
                side, funds, self.config.lot_size, cap_buffer
            ),
        }
    }

    fn flatten(&self, position: f64, why: &str) -> ExecutionDecision {
        if position > 0.0 {
            ExecutionDecision {
                action: ExecutionAction::Flatten {
                    side: Side::Sell,
                    quantity: position,
                },
                reason: format!("{}: closing long {}", why, position),
            }
        } else if position < 0.0 {
            ExecutionDecision {
                action: ExecutionAction::Flatten {
                    side: Side::Buy,
                    quantity: -position,
                },
                reason: format!("{}: closing short {}", why, -position),
            }
        } else {
            ExecutionDecision::skip(format!("{}: already flat", why))
        }
    }
}
