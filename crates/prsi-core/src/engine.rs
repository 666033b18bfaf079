//! Deterministic card-game state machine. Pure with respect to the
//! [`GameState`] passed in: no I/O, no knowledge of connections or rooms.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::card::{Card, Rank, Suit};
use crate::protocol::ErrorCode;

pub const MAX_HAND: usize = 32;

/// Per-room game state. Carries its own RNG so every shuffle — including a
/// deck refill mid-game — draws from the same stream, which keeps a given
/// seed reproducible across the whole game rather than just its opening deal.
pub struct GameState {
    rng: StdRng,
    deck: VecDeque<Card>,
    discard: Vec<Card>,
    hands: Vec<Vec<Card>>,
    pub top_card: Option<Card>,
    pub active_suit: Option<Suit>,
    pub penalty: u32,
    pub turn_pos: usize,
    pub running: bool,
    pub ended: bool,
}

/// Side effects of a successful [`GameState::play`], reported back to the
/// caller so it knows what to broadcast.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlayOutcome {
    pub added_penalty: u32,
    pub skip_next: bool,
    pub winner_pos: Option<usize>,
}

impl GameState {
    /// Builds a fresh, shuffled deck and marks the game running. Player hands
    /// are empty until [`deal`](Self::deal) is called.
    pub fn init(player_count: usize, seed: u64) -> GameState {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cards = Card::full_deck();
        cards.shuffle(&mut rng);

        GameState {
            rng,
            deck: cards.into(),
            discard: Vec::new(),
            hands: vec![Vec::new(); player_count],
            top_card: None,
            active_suit: None,
            penalty: 0,
            turn_pos: 0,
            running: true,
            ended: false,
        }
    }

    pub fn player_count(&self) -> usize {
        self.hands.len()
    }

    pub fn hand(&self, ppos: usize) -> &[Card] {
        &self.hands[ppos]
    }

    /// Draws one card, refilling the deck from the discard pile (keeping its
    /// current top) if the deck has run out. Returns `None` if even the
    /// discard pile can't supply one (at most one card remains there).
    fn draw_one(&mut self) -> Option<Card> {
        if self.deck.is_empty() {
            if self.discard.len() <= 1 {
                return None;
            }
            let keep = self.discard.pop().expect("len > 1 checked above");
            let mut refill = std::mem::take(&mut self.discard);
            refill.shuffle(&mut self.rng);
            self.deck = refill.into();
            self.discard = vec![keep];
        }
        self.deck.pop_front()
    }

    /// Deals `cards_each` cards to every player in order, stopping early
    /// (per player) if the deck is exhausted.
    pub fn deal(&mut self, cards_each: usize) {
        for p in 0..self.player_count() {
            for _ in 0..cards_each {
                match self.draw_one() {
                    Some(c) => self.hands[p].push(c),
                    None => break,
                }
            }
        }
    }

    /// Draws from the deck until a card whose rank is not Queen/Seven/Ace is
    /// found; that card becomes the starting top and sets the active suit.
    /// Every skipped card goes to the discard pile beneath it.
    pub fn pick_start_top(&mut self) {
        loop {
            let Some(c) = self.draw_one() else { break };
            if matches!(c.rank(), Rank::Queen | Rank::Seven | Rank::Ace) {
                self.discard.push(c);
                continue;
            }
            self.top_card = Some(c);
            self.active_suit = Some(c.suit());
            self.discard.push(c);
            break;
        }
    }

    fn hand_has(&self, ppos: usize, card: Card) -> bool {
        self.hands[ppos].contains(&card)
    }

    fn hand_remove(&mut self, ppos: usize, card: Card) {
        if let Some(i) = self.hands[ppos].iter().position(|&c| c == card) {
            self.hands[ppos].swap_remove(i);
        }
    }

    fn is_play_legal(&self, card: Card, wish: Option<Suit>) -> Result<(), ErrorCode> {
        if self.penalty > 0 {
            if card.rank() != Rank::Seven {
                return Err(ErrorCode::MustStackOrDraw);
            }
            return Ok(());
        }

        if card.rank() == Rank::Queen {
            return match wish {
                None => Err(ErrorCode::WishRequired),
                Some(_) => Ok(()),
            };
        }

        let top = self.top_card.expect("top_card set before any play is possible");
        if Some(card.suit()) == self.active_suit || card.rank() == top.rank() {
            return Ok(());
        }
        Err(ErrorCode::IllegalCard)
    }

    fn advance_turn(&mut self, skip_next: bool) {
        let n = self.player_count();
        self.turn_pos = (self.turn_pos + 1) % n;
        if skip_next {
            self.turn_pos = (self.turn_pos + 1) % n;
        }
    }

    /// Applies one move. `wish` is only consulted for Queens; any other
    /// rank ignores it even if present.
    pub fn play(
        &mut self,
        ppos: usize,
        card: Card,
        wish: Option<Suit>,
    ) -> Result<PlayOutcome, ErrorCode> {
        if !self.running || self.ended {
            return Err(ErrorCode::BadState);
        }
        if ppos != self.turn_pos {
            return Err(ErrorCode::NotYourTurn);
        }
        if !self.hand_has(ppos, card) {
            return Err(ErrorCode::NoSuchCard);
        }
        self.is_play_legal(card, wish)?;

        self.hand_remove(ppos, card);
        self.top_card = Some(card);
        self.discard.push(card);

        self.active_suit = if card.rank() == Rank::Queen {
            wish
        } else {
            Some(card.suit())
        };

        let mut out = PlayOutcome::default();
        if card.rank() == Rank::Seven {
            self.penalty += 2;
            out.added_penalty = 2;
        }
        if card.rank() == Rank::Ace {
            out.skip_next = true;
        }

        if self.hands[ppos].is_empty() {
            self.ended = true;
            out.winner_pos = Some(ppos);
            return Ok(out);
        }

        self.advance_turn(out.skip_next);
        Ok(out)
    }

    /// Draws `penalty` cards if any are owed, else exactly one. Clears the
    /// penalty unconditionally afterward, even if the deck ran dry early.
    /// Drawing always forfeits the turn.
    pub fn draw(&mut self, ppos: usize) -> Result<Vec<Card>, ErrorCode> {
        if !self.running || self.ended {
            return Err(ErrorCode::BadState);
        }
        if ppos != self.turn_pos {
            return Err(ErrorCode::NotYourTurn);
        }

        let n = if self.penalty > 0 { self.penalty } else { 1 };
        let mut drawn = Vec::new();
        for _ in 0..n {
            let Some(c) = self.draw_one() else { break };
            if self.hands[ppos].len() < MAX_HAND {
                self.hands[ppos].push(c);
                drawn.push(c);
            }
        }

        self.penalty = 0;
        self.advance_turn(false);
        Ok(drawn)
    }

    /// Removes a player from the game mid-round, shifting higher positions
    /// down and fixing up the turn pointer. Mirrors the room manager's
    /// in-game compaction, kept here since it touches hand/turn invariants
    /// the engine owns.
    pub fn remove_player(&mut self, k: usize) {
        if self.turn_pos > k {
            self.turn_pos -= 1;
        }
        self.hands.remove(k);
        if self.turn_pos >= self.player_count() && self.player_count() > 0 {
            self.turn_pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(player_count: usize, seed: u64) -> GameState {
        let mut g = GameState::init(player_count, seed);
        g.deal(4);
        g.pick_start_top();
        g
    }

    #[test]
    fn deck_discard_hands_cover_all_32_cards() {
        let g = started(4, 42);
        let mut all: Vec<u8> = g.deck.iter().map(|c| c.0).collect();
        all.extend(g.discard.iter().map(|c| c.0));
        for h in &g.hands {
            all.extend(h.iter().map(|c| c.0));
        }
        all.sort_unstable();
        assert_eq!(all, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn top_card_is_never_queen_seven_or_ace() {
        for seed in 0..20 {
            let g = started(3, seed);
            let top = g.top_card.expect("pick_start_top always finds a card in a 32-card deck");
            assert!(!matches!(top.rank(), Rank::Queen | Rank::Seven | Rank::Ace));
        }
    }

    #[test]
    fn determinism_same_seed_same_actions() {
        let a = started(4, 7);
        let b = started(4, 7);
        assert_eq!(a.top_card, b.top_card);
        assert_eq!(a.hands, b.hands);
    }

    #[test]
    fn wrong_turn_is_rejected() {
        let mut g = started(3, 1);
        let other = (g.turn_pos + 1) % 3;
        let card = g.hands[other][0];
        assert_eq!(g.play(other, card, None), Err(ErrorCode::NotYourTurn));
    }

    #[test]
    fn penalty_must_be_stacked_or_drawn() {
        let mut g = started(2, 3);
        g.penalty = 2;
        let turn = g.turn_pos;
        // Force a non-seven card into the current player's hand.
        let non_seven = Card::full_deck()
            .into_iter()
            .find(|c| c.rank() != Rank::Seven)
            .unwrap();
        g.hands[turn] = vec![non_seven];
        assert_eq!(g.play(turn, non_seven, None), Err(ErrorCode::MustStackOrDraw));
    }

    #[test]
    fn queen_without_wish_is_rejected() {
        let mut g = started(2, 9);
        let turn = g.turn_pos;
        let queen = Card::full_deck()
            .into_iter()
            .find(|c| c.rank() == Rank::Queen)
            .unwrap();
        g.hands[turn] = vec![queen];
        g.penalty = 0;
        assert_eq!(g.play(turn, queen, None), Err(ErrorCode::WishRequired));
    }

    #[test]
    fn draw_clears_penalty_and_forfeits_turn() {
        let mut g = started(3, 11);
        g.penalty = 2;
        let turn = g.turn_pos;
        let drawn = g.draw(turn).unwrap();
        assert!(drawn.len() <= 2);
        assert_eq!(g.penalty, 0);
        assert_ne!(g.turn_pos, turn);
    }

    #[test]
    fn emptying_hand_ends_game_without_advancing_turn() {
        let mut g = started(2, 4);
        let turn = g.turn_pos;
        g.active_suit = Some(Suit::Spades);
        g.top_card = Some(Card::new(0));
        let only = Card::new(1); // S8, matches active suit
        g.hands[turn] = vec![only];
        let out = g.play(turn, only, None).unwrap();
        assert_eq!(out.winner_pos, Some(turn));
        assert!(g.ended);
        assert_eq!(g.turn_pos, turn);
    }

    #[test]
    fn remove_player_shifts_turn_pointer() {
        let mut g = started(4, 20);
        g.turn_pos = 3;
        g.remove_player(1);
        assert_eq!(g.turn_pos, 2);
        assert_eq!(g.player_count(), 3);
    }
}
