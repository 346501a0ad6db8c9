//! # Volume Planning and Command Grammar
//!
//! The server refuses a `fill` that touches more than `block_ceiling` blocks
//! (32,768 by default). A chunk clear around a player covers a
//! `(2R+1) x (2R+1)` footprint over the whole world height, which is far more
//! than that, so the vertical span is cut into slabs:
//!
//! ```text
//! slab height = floor(ceiling / footprint)
//! R = 8, -64..320, ceiling 32768  ->  footprint 289, height 113, 4 slabs
//! ```
//!
//! The radius "place" edit goes through the same planner with a span relative
//! to the player (`~-1..~r`). For every allowed radius that span fits in a
//! single slab, so it stays a single command.

use crate::error::{AppResult, BotError};

/// How Y coordinates of a span are written in commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YReference {
    /// World coordinates, written as `-64`
    Absolute,
    /// Offsets from the executing player, written as `~-1`
    Relative,
}

/// Inclusive vertical range `[min_y, max_y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerticalSpan {
    pub min_y: i32,
    pub max_y: i32,
    pub reference: YReference,
}

impl VerticalSpan {
    pub fn absolute(min_y: i32, max_y: i32) -> Self {
        Self {
            min_y,
            max_y,
            reference: YReference::Absolute,
        }
    }

    pub fn relative(min_y: i32, max_y: i32) -> Self {
        Self {
            min_y,
            max_y,
            reference: YReference::Relative,
        }
    }

    /// Number of block layers in the span.
    pub fn height(&self) -> u64 {
        (self.max_y as i64 - self.min_y as i64 + 1).max(0) as u64
    }

    fn format_y(&self, y: i32) -> String {
        match self.reference {
            YReference::Absolute => y.to_string(),
            YReference::Relative => format!("~{}", y),
        }
    }
}

/// One vertical sub-range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slab {
    pub y_start: i32,
    pub y_end: i32,
}

impl Slab {
    pub fn height(&self) -> u64 {
        (self.y_end as i64 - self.y_start as i64 + 1) as u64
    }
}

/// Ordered slabs covering one edit region around a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub radius: u32,
    pub span: VerticalSpan,
    pub slabs: Vec<Slab>,
}

impl CommandPlan {
    /// Blocks in one horizontal layer of the footprint.
    pub fn footprint(&self) -> u64 {
        footprint(self.radius)
    }

    pub fn volume(&self, slab: &Slab) -> u64 {
        self.footprint() * slab.height()
    }

    /// Render one `fill` command per slab for `player`.
    pub fn commands(&self, player: &str, block: &str, replace: &str) -> Vec<String> {
        self.slabs
            .iter()
            .map(|slab| fill_command(player, self.radius, &self.span, slab, block, replace))
            .collect()
    }
}

/// Side length squared of the square footprint centred on the player.
pub fn footprint(radius: u32) -> u64 {
    let side = 2 * radius as u64 + 1;
    side * side
}

/// Split `span` into contiguous slabs each holding at most `ceiling` blocks.
///
/// ## Guarantees:
/// - slabs are ordered bottom-up, contiguous and non-overlapping
/// - their union is exactly `[span.min_y, span.max_y]`
/// - every slab but the last has height `floor(ceiling / footprint)`
///
/// ## Errors:
/// `BotError::Config` when the span is inverted or a single layer of the
/// footprint already exceeds the ceiling.
pub fn plan_slabs(radius: u32, span: VerticalSpan, ceiling: u64) -> AppResult<CommandPlan> {
    if span.min_y > span.max_y {
        return Err(BotError::Config(format!(
            "Vertical span {}..{} is inverted",
            span.min_y, span.max_y
        )));
    }

    let area = footprint(radius);
    let slab_height = ceiling / area;
    if slab_height == 0 {
        return Err(BotError::Config(format!(
            "Footprint of radius {} ({} blocks) exceeds the per-command ceiling {}",
            radius, area, ceiling
        )));
    }

    let mut slabs = Vec::with_capacity(span.height().div_ceil(slab_height) as usize);
    let mut y_start = span.min_y as i64;
    let max_y = span.max_y as i64;
    while y_start <= max_y {
        let y_end = (y_start + slab_height as i64 - 1).min(max_y);
        slabs.push(Slab {
            y_start: y_start as i32,
            y_end: y_end as i32,
        });
        y_start = y_end + 1;
    }

    Ok(CommandPlan { radius, span, slabs })
}

/// `execute as <player> at @s run fill ~-R <y0> ~-R ~R <y1> ~R <block> replace <target>`
pub fn fill_command(
    player: &str,
    radius: u32,
    span: &VerticalSpan,
    slab: &Slab,
    block: &str,
    replace: &str,
) -> String {
    format!(
        "execute as {player} at @s run fill ~-{r} {y0} ~-{r} ~{r} {y1} ~{r} {block} replace {replace}",
        player = player,
        r = radius,
        y0 = span.format_y(slab.y_start),
        y1 = span.format_y(slab.y_end),
        block = block,
        replace = replace,
    )
}

/// Span of the radius place edit: one layer below the feet up to `radius` above.
pub fn place_span(radius: u32) -> VerticalSpan {
    VerticalSpan::relative(-1, radius as i32)
}

/// `say "<message>"` with backslashes and double quotes escaped.
pub fn say_command(message: &str) -> String {
    let escaped = message.replace('\\', "\\\\").replace('"', "\\\"");
    format!("say \"{}\"", escaped)
}

/// Parse the reply to `list`.
///
/// ```text
/// There are 2 of a max of 20 players online: Alice, Bob
/// ```
/// Names are whatever follows the last colon, comma separated. A reply with
/// a colon but no names means nobody is online.
pub fn parse_player_list(response: &str) -> AppResult<Vec<String>> {
    let (_, names) = response
        .rsplit_once(':')
        .ok_or_else(|| BotError::ProtocolParse(format!("No player list in reply: {:?}", response)))?;

    Ok(names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_plan_covers(plan: &CommandPlan, ceiling: u64) {
        let first = plan.slabs.first().unwrap();
        let last = plan.slabs.last().unwrap();
        assert_eq!(first.y_start, plan.span.min_y);
        assert_eq!(last.y_end, plan.span.max_y);

        for pair in plan.slabs.windows(2) {
            assert_eq!(pair[0].y_end + 1, pair[1].y_start);
        }
        for slab in &plan.slabs {
            assert!(slab.y_start <= slab.y_end);
            assert!(plan.volume(slab) <= ceiling);
        }
        let total: u64 = plan.slabs.iter().map(Slab::height).sum();
        assert_eq!(total, plan.span.height());
    }

    #[test]
    fn test_default_chunk_clear_plan() {
        let plan = plan_slabs(8, VerticalSpan::absolute(-64, 320), 32768).unwrap();
        assert_eq!(plan.footprint(), 289);
        assert_eq!(
            plan.slabs,
            vec![
                Slab { y_start: -64, y_end: 48 },
                Slab { y_start: 49, y_end: 161 },
                Slab { y_start: 162, y_end: 274 },
                Slab { y_start: 275, y_end: 320 },
            ]
        );
        assert_plan_covers(&plan, 32768);
    }

    #[test]
    fn test_slabs_cover_span_for_many_shapes() {
        for radius in 0..=12u32 {
            for (min_y, max_y) in [(-64, 320), (0, 0), (-5, 5), (10, 300), (-2048, 2047)] {
                for ceiling in [footprint(radius), 1000, 32768, 1_000_000] {
                    if footprint(radius) > ceiling {
                        continue;
                    }
                    let plan = plan_slabs(radius, VerticalSpan::absolute(min_y, max_y), ceiling).unwrap();
                    assert_plan_covers(&plan, ceiling);
                }
            }
        }
    }

    #[test]
    fn test_rejects_impossible_plans() {
        assert!(plan_slabs(8, VerticalSpan::absolute(10, 0), 32768).is_err());
        assert!(plan_slabs(100, VerticalSpan::absolute(0, 10), 32768).is_err());
    }

    #[test]
    fn test_place_plan_is_single_command() {
        for radius in 0..=10 {
            let plan = plan_slabs(radius, place_span(radius), 32768).unwrap();
            assert_eq!(plan.slabs.len(), 1);
        }
        let plan = plan_slabs(3, place_span(3), 32768).unwrap();
        assert_eq!(
            plan.commands("Steve", "minecraft:stone", "minecraft:air"),
            vec!["execute as Steve at @s run fill ~-3 ~-1 ~-3 ~3 ~3 ~3 minecraft:stone replace minecraft:air"]
        );
    }

    #[test]
    fn test_slab_command_grammar() {
        let span = VerticalSpan::absolute(-64, 320);
        let slab = Slab { y_start: -64, y_end: 48 };
        assert_eq!(
            fill_command("Alice", 8, &span, &slab, "minecraft:air", "minecraft:grass_block"),
            "execute as Alice at @s run fill ~-8 -64 ~-8 ~8 48 ~8 minecraft:air replace minecraft:grass_block"
        );
    }

    #[test]
    fn test_say_escaping() {
        assert_eq!(say_command("hello"), r#"say "hello""#);
        assert_eq!(say_command(r#"a "quote" and \ slash"#), r#"say "a \"quote\" and \\ slash""#);
    }

    #[test]
    fn test_parse_player_list() {
        assert_eq!(
            parse_player_list("There are 2 of a max of 20 players online: Alice, Bob").unwrap(),
            vec!["Alice", "Bob"]
        );
        assert!(parse_player_list("There are 0 of a max of 20 players online:").unwrap().is_empty());
        assert!(matches!(
            parse_player_list("garbage"),
            Err(BotError::ProtocolParse(_))
        ));
    }
}
